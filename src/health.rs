use std::future::pending;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{TimeoutError, WaitError};

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub reachable: bool,
    pub status: Option<u16>,
    pub checked_at: SystemTime,
}

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadySource {
    Probe,
    LogHint,
}

#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub source: ReadySource,
    pub elapsed: Duration,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    client: Client,
}

impl HealthMonitor {
    /// `probe_timeout` bounds the TCP connect. The whole request gets twice
    /// that, so a request timeout always means the connection was accepted.
    pub fn new(probe_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .no_proxy()
            .connect_timeout(probe_timeout)
            .timeout(probe_timeout * 2)
            .build()?;
        Ok(Self { client })
    }

    /// One GET. Any HTTP answer counts, as does any failure after the TCP
    /// connection was accepted, including a server that never answers.
    pub async fn check(&self, url: &str) -> HealthCheckResult {
        let checked_at = SystemTime::now();
        match self.client.get(url).send().await {
            Ok(response) => HealthCheckResult {
                reachable: true,
                status: Some(response.status().as_u16()),
                checked_at,
            },
            Err(err) if err.is_connect() || err.is_builder() => {
                debug!("health probe {url}: {err}");
                HealthCheckResult {
                    reachable: false,
                    status: None,
                    checked_at,
                }
            }
            Err(err) => {
                debug!("health probe {url} connected but failed: {err}");
                HealthCheckResult {
                    reachable: true,
                    status: None,
                    checked_at,
                }
            }
        }
    }

    /// Polls `url` until it answers, the `hint` flips to true, the timeout runs
    /// out, or `cancel` fires.
    pub async fn wait_until_ready(
        &self,
        url: &str,
        options: &WaitOptions,
        hint: Option<watch::Receiver<bool>>,
        cancel: &CancellationToken,
    ) -> Result<Readiness, WaitError> {
        let started = Instant::now();
        let deadline = started + options.timeout;
        let attempts = AtomicU32::new(0);

        let log_hint = async move {
            match hint {
                Some(mut rx) => {
                    if rx.wait_for(|seen| *seen).await.is_err() {
                        pending::<()>().await;
                    }
                }
                None => pending::<()>().await,
            }
        };

        let probe_loop = async {
            loop {
                attempts.fetch_add(1, Ordering::Relaxed);
                if self.check(url).await.reachable {
                    return true;
                }
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                tokio::time::sleep(options.interval.min(deadline - now)).await;
            }
        };

        let source = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = log_hint => ReadySource::LogHint,
            reached = probe_loop => {
                if !reached {
                    return Err(TimeoutError {
                        url: url.to_string(),
                        elapsed: started.elapsed(),
                        attempts: attempts.load(Ordering::Relaxed),
                    }
                    .into());
                }
                ReadySource::Probe
            }
        };

        let readiness = Readiness {
            source,
            elapsed: started.elapsed(),
            attempts: attempts.load(Ordering::Relaxed),
        };
        info!(
            "{url} ready via {:?} after {}ms ({} probes)",
            readiness.source,
            readiness.elapsed.as_millis(),
            readiness.attempts
        );
        Ok(readiness)
    }
}
