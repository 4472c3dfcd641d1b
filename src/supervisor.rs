//! Drives the server through provisioning, launch and readiness, and owns the
//! only handle to the running process.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::UNIX_EPOCH;

use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandRunner, SystemRunner};
use crate::config::SupervisorConfig;
use crate::error::{ProvisionError, SupervisorError, SupervisorErrorKind, WaitError};
use crate::health::{HealthMonitor, Readiness, WaitOptions};
use crate::launcher::{self, LaunchSpec, ProcessState, ServerProcessHandle};
use crate::platform::Platform;
use crate::provision::{ProvisionSettings, Provisioner};
use crate::resolver::{RuntimeDescriptor, RuntimeKind};
use crate::staging;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Provisioning,
    Launching,
    WaitingHealthy,
    Ready,
    ShuttingDown,
    Stopped,
    Failed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::Provisioning => "provisioning the environment",
            Self::Launching => "launching the server",
            Self::WaitingHealthy => "waiting for the server",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerEndpoint {
    pub url: String,
    pub host: String,
    pub port: u16,
    /// Reachable server this application did not start.
    pub external: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub endpoint: String,
    pub pid: Option<u32>,
    pub external: bool,
    pub degraded: Option<String>,
    pub last_error: Option<String>,
    pub started_at_ms: Option<u64>,
    pub interpreter: Option<String>,
}

struct Inner {
    state: SupervisorState,
    handle: Option<ServerProcessHandle>,
    interpreter: RuntimeDescriptor,
    package_manager: RuntimeDescriptor,
    external: bool,
    degraded: Option<String>,
    last_error: Option<String>,
}

pub struct Supervisor<R: CommandRunner = SystemRunner> {
    config: SupervisorConfig,
    health: HealthMonitor,
    provisioner: Provisioner<R>,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<SupervisorStatus>,
    cancel: StdMutex<CancellationToken>,
    shutdown_requested: AtomicBool,
}

impl<R: CommandRunner> Supervisor<R> {
    pub fn new(config: SupervisorConfig, runner: R) -> Result<Self, SupervisorError> {
        let config = config.normalized();
        let health = HealthMonitor::new(config.probe_timeout())
            .map_err(|err| SupervisorError::new(SupervisorState::Idle, err))?;
        let settings = ProvisionSettings::from_config(&config);
        let platform = settings.platform;
        let provisioner = Provisioner::new(Arc::new(runner), settings);

        let inner = Inner {
            state: SupervisorState::Idle,
            handle: None,
            interpreter: RuntimeDescriptor::new(RuntimeKind::Interpreter, platform),
            package_manager: RuntimeDescriptor::new(RuntimeKind::PackageManager, platform),
            external: false,
            degraded: None,
            last_error: None,
        };
        let (status_tx, _) = watch::channel(snapshot(&config, &inner));

        Ok(Self {
            config,
            health,
            provisioner,
            inner: Mutex::new(inner),
            status_tx,
            cancel: StdMutex::new(CancellationToken::new()),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn platform(&self) -> Platform {
        self.provisioner.settings().platform
    }

    pub fn provisioner(&self) -> &Provisioner<R> {
        &self.provisioner
    }

    pub fn endpoint_url(&self) -> String {
        self.config.endpoint_url()
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    /// Calls `callback` with the current status and then on every change.
    /// Must be called from within a tokio runtime.
    pub fn on_status_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&SupervisorStatus) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            let current = rx.borrow_and_update().clone();
            callback(&current);
            while rx.changed().await.is_ok() {
                let next = rx.borrow_and_update().clone();
                callback(&next);
            }
        })
    }

    /// Brings the server to `Ready`, reusing whatever already runs.
    pub async fn ensure_running(&self) -> Result<ServerEndpoint, SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::new(
                self.status().state,
                SupervisorErrorKind::ShuttingDown,
            ));
        }
        let mut guard = self.inner.lock().await;
        self.ensure_running_locked(&mut guard).await
    }

    /// Terminal: cancels in-flight work, stops the owned server and refuses
    /// later `ensure_running` calls.
    pub async fn shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::AcqRel) {
            info!("supervisor shutdown requested");
        }
        self.current_token().cancel();

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.state == SupervisorState::Stopped && inner.handle.is_none() {
            return;
        }
        self.transition(inner, SupervisorState::ShuttingDown);
        self.stop_child(inner).await;
        inner.external = false;
        self.transition(inner, SupervisorState::Stopped);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Stops the owned server without shutting the supervisor down.
    pub async fn stop_server(&self) -> Result<(), SupervisorError> {
        self.current_token().cancel();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        self.renew_token();
        if inner.external {
            return Err(SupervisorError::new(
                inner.state,
                SupervisorErrorKind::ExternalServer(self.endpoint_url()),
            ));
        }
        self.stop_child(inner).await;
        self.transition(inner, SupervisorState::Stopped);
        Ok(())
    }

    pub async fn restart(&self) -> Result<ServerEndpoint, SupervisorError> {
        self.current_token().cancel();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        self.renew_token();
        if inner.external {
            return Err(SupervisorError::new(
                inner.state,
                SupervisorErrorKind::ExternalServer(self.endpoint_url()),
            ));
        }
        info!("restarting server");
        self.stop_child(inner).await;
        self.transition(inner, SupervisorState::Stopped);
        self.ensure_running_locked(inner).await
    }

    /// Runs `f` with the owned server stopped, then restarts it if it had been
    /// running. The supervisor lock is held throughout.
    pub async fn with_server_stopped<F, Fut, T>(&self, f: F) -> Result<T, SupervisorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if self.is_shutting_down() {
            return Err(SupervisorError::new(inner.state, SupervisorErrorKind::ShuttingDown));
        }

        let owned_alive = match inner.handle.as_mut() {
            Some(handle) => handle.poll_exit().is_none(),
            None => false,
        };
        let foreign = inner.external
            || (!owned_alive && self.health.check(&self.endpoint_url()).await.reachable);
        if foreign {
            return Err(SupervisorError::new(
                inner.state,
                SupervisorErrorKind::ExternalServer(self.endpoint_url()),
            ));
        }

        if owned_alive {
            info!("stopping server for maintenance");
            self.stop_child(inner).await;
            self.transition(inner, SupervisorState::Stopped);
        }
        let out = f().await;
        if owned_alive {
            info!("restarting server after maintenance");
            self.ensure_running_locked(inner).await?;
        }
        Ok(out)
    }

    async fn ensure_running_locked(
        &self,
        inner: &mut Inner,
    ) -> Result<ServerEndpoint, SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::new(inner.state, SupervisorErrorKind::ShuttingDown));
        }
        let cancel = self.current_token();
        let url = self.endpoint_url();

        if inner.state == SupervisorState::Ready {
            if inner.external {
                if self.health.check(&url).await.reachable {
                    return Ok(self.endpoint(true));
                }
                warn!("external server at {url} went away; starting our own");
                inner.external = false;
            } else if let Some(handle) = inner.handle.as_mut() {
                match handle.poll_exit() {
                    None => return Ok(self.endpoint(false)),
                    Some(status) => warn!("server exited while ready ({status}); relaunching"),
                }
            }
        }

        if let Some(handle) = inner.handle.as_mut() {
            if handle.poll_exit().is_none() {
                info!(
                    "server pid {} is alive ({:?}); waiting for it again",
                    handle.pid(),
                    handle.state()
                );
                return self.await_ready(inner, &cancel).await;
            }
            inner.handle = None;
        }

        if self.health.check(&url).await.reachable {
            info!("a server already answers at {url}; adopting it");
            inner.external = true;
            inner.degraded = None;
            inner.last_error = None;
            self.transition(inner, SupervisorState::Ready);
            return Ok(self.endpoint(true));
        }
        inner.external = false;

        self.transition(inner, SupervisorState::Provisioning);
        if let Err(kind) = self.stage().await {
            return Err(self.fail(inner, kind));
        }
        let python = match self.provision(inner, &cancel).await {
            Ok(python) => python,
            Err(SupervisorErrorKind::Cancelled) => return Err(self.cancelled(inner)),
            Err(kind) => return Err(self.fail(inner, kind)),
        };
        if cancel.is_cancelled() {
            return Err(self.cancelled(inner));
        }

        self.transition(inner, SupervisorState::Launching);
        let handle = match launcher::start(self.launch_spec(&python)).await {
            Ok(handle) => handle,
            Err(err) => return Err(self.fail(inner, err)),
        };
        inner.handle = Some(handle);
        self.await_ready(inner, &cancel).await
    }

    async fn stage(&self) -> Result<(), SupervisorErrorKind> {
        let Some(source) = self.config.source_dir.clone() else {
            return Ok(());
        };
        let target = self.config.server_dir.clone();
        let stamp = self.config.stage_stamp.clone();
        let preserve = self.config.preserve.clone();
        let dest = target.clone();
        let result = tokio::task::spawn_blocking(move || {
            staging::stage_server_tree(&source, &dest, &stamp, &preserve)
        })
        .await
        .unwrap_or_else(|join| Err(io::Error::new(io::ErrorKind::Other, join.to_string())));
        result
            .map(|_| ())
            .map_err(|source| SupervisorErrorKind::Staging {
                path: target,
                source,
            })
    }

    /// Returns the interpreter to launch with. Falls back to the system
    /// interpreter when provisioning fails and degraded mode is allowed.
    async fn provision(
        &self,
        inner: &mut Inner,
        cancel: &CancellationToken,
    ) -> Result<String, SupervisorErrorKind> {
        let err = match self
            .provisioner
            .ensure_environment(&mut inner.interpreter, &mut inner.package_manager, cancel)
            .await
        {
            Ok(env) => {
                inner.degraded = None;
                return Ok(env.python.to_string_lossy().to_string());
            }
            Err(ProvisionError::Cancelled(_)) => return Err(SupervisorErrorKind::Cancelled),
            Err(err) => err,
        };

        if !self.config.allow_degraded {
            return Err(err.into());
        }
        if inner.interpreter.effective_path().is_none()
            && !matches!(err, ProvisionError::InterpreterMissing { .. })
        {
            let resolved = tokio::select! {
                _ = cancel.cancelled() => return Err(SupervisorErrorKind::Cancelled),
                result = self.provisioner.resolve_interpreter(&mut inner.interpreter) => result,
            };
            if let Err(not_found) = resolved {
                warn!("{not_found}");
            }
        }
        match inner.interpreter.effective_path() {
            Some(python) => {
                warn!("running degraded with system interpreter {python}: {err}");
                inner.degraded = Some(err.to_string());
                Ok(python.to_string())
            }
            None => Err(err.into()),
        }
    }

    fn launch_spec(&self, python: &str) -> LaunchSpec {
        let server_dir = self.config.server_dir.clone();
        let mut env = BTreeMap::new();
        env.insert(
            "PYTHONPATH".to_string(),
            server_dir.to_string_lossy().to_string(),
        );
        env.insert(
            "DJANGO_SETTINGS_MODULE".to_string(),
            self.config.settings_module.clone(),
        );
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        env.extend(self.config.extra_env.clone());

        let mut args = vec![server_dir
            .join(&self.config.entrypoint)
            .to_string_lossy()
            .to_string()];
        args.extend(self.config.server_args.iter().cloned());
        args.push(self.config.bind_address());

        LaunchSpec {
            program: python.to_string(),
            args,
            cwd: server_dir,
            env,
            detached: self.config.detached,
            ready_patterns: self.config.ready_patterns.clone(),
            log_tail_lines: self.config.log_tail_lines,
            log_file: self.config.server_log.clone(),
        }
    }

    async fn await_ready(
        &self,
        inner: &mut Inner,
        cancel: &CancellationToken,
    ) -> Result<ServerEndpoint, SupervisorError> {
        self.transition(inner, SupervisorState::WaitingHealthy);
        let Some(mut handle) = inner.handle.take() else {
            let kind = SupervisorErrorKind::ExitedEarly {
                code: None,
                stderr_tail: String::new(),
            };
            return Err(self.fail(inner, kind));
        };

        enum Outcome {
            Wait(Result<Readiness, WaitError>),
            Exited(io::Result<ExitStatus>),
        }

        let url = self.endpoint_url();
        let options = WaitOptions {
            timeout: self.config.startup_timeout(),
            interval: self.config.poll_interval(),
        };
        let hint = handle.ready_signal();
        let outcome = tokio::select! {
            result = self.health.wait_until_ready(&url, &options, Some(hint), cancel) => Outcome::Wait(result),
            status = handle.wait() => Outcome::Exited(status),
        };

        match outcome {
            Outcome::Wait(Ok(_)) => {
                handle.set_state(ProcessState::Running);
                inner.handle = Some(handle);
                inner.last_error = None;
                self.transition(inner, SupervisorState::Ready);
                Ok(self.endpoint(false))
            }
            Outcome::Wait(Err(WaitError::Cancelled)) => {
                inner.handle = Some(handle);
                Err(self.cancelled(inner))
            }
            Outcome::Wait(Err(WaitError::Timeout(timeout))) => {
                // Kept alive: it may still come up, and the next call waits again.
                handle.set_state(ProcessState::Unresponsive);
                inner.handle = Some(handle);
                Err(self.fail(inner, timeout))
            }
            Outcome::Exited(status) => {
                let stderr_tail = handle.stderr_tail(STDERR_TAIL_LINES);
                let code = match status {
                    Ok(status) => status.code(),
                    Err(err) => {
                        warn!("cannot collect server exit status: {err}");
                        None
                    }
                };
                Err(self.fail(inner, SupervisorErrorKind::ExitedEarly { code, stderr_tail }))
            }
        }
    }

    async fn stop_child(&self, inner: &mut Inner) {
        if let Some(mut handle) = inner.handle.take() {
            if let Err(err) = handle.terminate(self.config.stop_grace()).await {
                error!("failed to stop server pid {}: {err}", handle.pid());
            }
        }
    }

    /// The canceller (`shutdown`, `stop_server`, `restart`) stops the child
    /// once it holds the lock.
    fn cancelled(&self, inner: &mut Inner) -> SupervisorError {
        let err = SupervisorError::new(inner.state, SupervisorErrorKind::Cancelled);
        info!("{err}");
        err
    }

    fn fail(&self, inner: &mut Inner, kind: impl Into<SupervisorErrorKind>) -> SupervisorError {
        let err = SupervisorError::new(inner.state, kind);
        error!("{err}");
        inner.last_error = Some(err.to_string());
        self.transition(inner, SupervisorState::Failed);
        err
    }

    fn transition(&self, inner: &mut Inner, state: SupervisorState) {
        if inner.state != state {
            info!("supervisor: {:?} -> {:?}", inner.state, state);
        }
        inner.state = state;
        self.status_tx.send_replace(snapshot(&self.config, inner));
    }

    fn endpoint(&self, external: bool) -> ServerEndpoint {
        ServerEndpoint {
            url: self.endpoint_url(),
            host: self.config.host.clone(),
            port: self.config.port,
            external,
        }
    }

    fn current_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn renew_token(&self) {
        if self.is_shutting_down() {
            return;
        }
        let mut token = match self.cancel.lock() {
            Ok(token) => token,
            Err(poisoned) => poisoned.into_inner(),
        };
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }
}

fn snapshot(config: &SupervisorConfig, inner: &Inner) -> SupervisorStatus {
    let (pid, started_at_ms) = match inner.handle.as_ref() {
        Some(handle) => (
            Some(handle.pid()),
            handle
                .started_at()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_millis() as u64),
        ),
        None => (None, None),
    };
    SupervisorStatus {
        state: inner.state,
        endpoint: config.endpoint_url(),
        pid,
        external: inner.external,
        degraded: inner.degraded.clone(),
        last_error: inner.last_error.clone(),
        started_at_ms,
        interpreter: inner.interpreter.effective_path().map(str::to_string),
    }
}
