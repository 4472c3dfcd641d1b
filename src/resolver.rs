use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::command::{CommandRunner, CommandSpec};
use crate::error::NotFoundError;
use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Interpreter,
    PackageManager,
}

impl RuntimeKind {
    /// Text a successful `--version` probe must contain.
    pub fn signature(self) -> &'static str {
        match self {
            Self::Interpreter => "python",
            Self::PackageManager => "pip",
        }
    }

    fn fallback(self, platform: Platform) -> &'static str {
        match self {
            Self::Interpreter => platform.strategy().interpreter_fallback,
            Self::PackageManager => platform.strategy().package_manager_fallback,
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interpreter => f.write_str("interpreter"),
            Self::PackageManager => f.write_str("package manager"),
        }
    }
}

/// What to do when every candidate fails its probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    #[default]
    FailFast,
    /// Hand back the platform's bare command name, unverified.
    BareCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeFailure {
    pub candidate: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeDescriptor {
    pub kind: RuntimeKind,
    pub platform: Platform,
    pub resolved_path: Option<String>,
    pub version: Option<String>,
    pub candidates_tried: Vec<String>,
    pub failures: Vec<ProbeFailure>,
    pub fallback: Option<String>,
}

impl RuntimeDescriptor {
    pub fn new(kind: RuntimeKind, platform: Platform) -> Self {
        Self {
            kind,
            platform,
            resolved_path: None,
            version: None,
            candidates_tried: Vec::new(),
            failures: Vec::new(),
            fallback: None,
        }
    }

    /// Verified path if there is one, otherwise the unverified fallback.
    pub fn effective_path(&self) -> Option<&str> {
        self.resolved_path
            .as_deref()
            .or(self.fallback.as_deref())
    }

    /// Forgets a cached resolution, e.g. after the environment it pointed into
    /// was deleted.
    pub fn reset(&mut self) {
        self.resolved_path = None;
        self.version = None;
        self.candidates_tried.clear();
        self.failures.clear();
        self.fallback = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: String,
    pub verified: bool,
}

pub struct Resolver<'a, R> {
    runner: &'a R,
    probe_timeout: Duration,
}

impl<'a, R: CommandRunner> Resolver<'a, R> {
    pub fn new(runner: &'a R, probe_timeout: Duration) -> Self {
        Self {
            runner,
            probe_timeout,
        }
    }

    pub async fn resolve(
        &self,
        descriptor: &mut RuntimeDescriptor,
        candidates: &[String],
        policy: FallbackPolicy,
    ) -> Result<Resolution, NotFoundError> {
        if let Some(path) = descriptor.resolved_path.as_ref() {
            return Ok(Resolution {
                path: path.clone(),
                verified: true,
            });
        }

        descriptor.candidates_tried.clear();
        descriptor.failures.clear();
        let signature = descriptor.kind.signature();
        for candidate in candidates {
            descriptor.candidates_tried.push(candidate.clone());

            let spec = CommandSpec::new(candidate.as_str(), self.probe_timeout).arg("--version");
            let reason = match self.runner.run(&spec).await {
                Ok(output) if output.success() => {
                    let text = output.combined();
                    if text.to_lowercase().contains(signature) {
                        let version = text.lines().next().unwrap_or_default().trim().to_string();
                        info!(
                            "resolved {} {} ({})",
                            descriptor.kind, candidate, version
                        );
                        descriptor.resolved_path = Some(candidate.clone());
                        descriptor.version = Some(version);
                        descriptor.fallback = None;
                        return Ok(Resolution {
                            path: candidate.clone(),
                            verified: true,
                        });
                    }
                    format!("unexpected version output: {}", text.trim())
                }
                Ok(output) => match output.code {
                    Some(code) => format!("exit code {code}: {}", output.tail(3)),
                    None => "terminated by signal".to_string(),
                },
                Err(err) => err.to_string(),
            };
            debug!("{} candidate {candidate} rejected: {reason}", descriptor.kind);
            descriptor.failures.push(ProbeFailure {
                candidate: candidate.clone(),
                reason,
            });
        }

        match policy {
            FallbackPolicy::FailFast => Err(not_found(descriptor)),
            FallbackPolicy::BareCommand => Ok(apply_fallback(descriptor)),
        }
    }
}

pub fn not_found(descriptor: &RuntimeDescriptor) -> NotFoundError {
    NotFoundError {
        kind: descriptor.kind,
        platform: descriptor.platform,
        candidates_tried: descriptor.candidates_tried.clone(),
        failures: descriptor.failures.clone(),
    }
}

/// Records the platform's bare command as an unverified fallback without probing.
pub fn apply_fallback(descriptor: &mut RuntimeDescriptor) -> Resolution {
    let bare = descriptor.kind.fallback(descriptor.platform).to_string();
    warn!(
        "no working {} among [{}]; falling back to unverified `{bare}`",
        descriptor.kind,
        descriptor.candidates_tried.join(", ")
    );
    descriptor.fallback = Some(bare.clone());
    Resolution {
        path: bare,
        verified: false,
    }
}
