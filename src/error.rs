use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::platform::Platform;
use crate::resolver::{ProbeFailure, RuntimeKind};
use crate::supervisor::SupervisorState;

/// A helper command (version probe, installer, pip) that never produced an exit status.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} did not finish within {}ms", .timeout.as_millis())]
    TimedOut { program: String, timeout: Duration },
}

#[derive(Debug, Error)]
#[error("no working {kind} found on {platform} (tried: {})", .candidates_tried.join(", "))]
pub struct NotFoundError {
    pub kind: RuntimeKind,
    pub platform: Platform,
    pub candidates_tried: Vec<String>,
    pub failures: Vec<ProbeFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyCheck {
    InterpreterVersion,
    FrameworkModule,
}

impl std::fmt::Display for VerifyCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InterpreterVersion => f.write_str("interpreter version"),
            Self::FrameworkModule => f.write_str("framework module"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    EnsureInterpreter,
    CreateEnvironment,
    InstallDependencies,
    Verify(VerifyCheck),
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnsureInterpreter => f.write_str("interpreter check"),
            Self::CreateEnvironment => f.write_str("environment creation"),
            Self::InstallDependencies => f.write_str("dependency install"),
            Self::Verify(check) => write!(f, "verification ({check})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{not_found}. {hint}")]
    InterpreterMissing {
        #[source]
        not_found: NotFoundError,
        hint: String,
    },

    #[error("{step} failed: {message}")]
    StepFailed {
        step: ProvisionStep,
        message: String,
        command: Option<String>,
        output: String,
    },

    #[error("provisioning cancelled before {0}")]
    Cancelled(ProvisionStep),
}

impl ProvisionError {
    pub fn step(&self) -> ProvisionStep {
        match self {
            Self::InterpreterMissing { .. } => ProvisionStep::EnsureInterpreter,
            Self::StepFailed { step, .. } => *step,
            Self::Cancelled(step) => *step,
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Self::StepFailed { command, .. } => command.as_deref(),
            _ => None,
        }
    }

    pub fn output(&self) -> &str {
        match self {
            Self::StepFailed { output, .. } => output,
            _ => "",
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to start {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
#[error("{url} was not reachable after {}ms ({attempts} attempts)", .elapsed.as_millis())]
pub struct TimeoutError {
    pub url: String,
    pub elapsed: Duration,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("health wait cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SupervisorErrorKind {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("server exited before becoming ready ({}){}", describe_code(.code), describe_tail(.stderr_tail))]
    ExitedEarly {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("the server at {0} is not managed by this application")]
    ExternalServer(String),

    #[error("failed to stage server files into {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to build health probe client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

fn describe_code(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn describe_tail(tail: &str) -> String {
    if tail.trim().is_empty() {
        String::new()
    } else {
        format!(": {}", tail.trim())
    }
}

#[derive(Debug, Error)]
#[error("{kind} (while {state})")]
pub struct SupervisorError {
    pub state: SupervisorState,
    #[source]
    pub kind: SupervisorErrorKind,
}

impl SupervisorError {
    pub fn new(state: SupervisorState, kind: impl Into<SupervisorErrorKind>) -> Self {
        Self {
            state,
            kind: kind.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.kind,
            SupervisorErrorKind::Cancelled | SupervisorErrorKind::ShuttingDown
        )
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Backup file not found: {0}")]
    NotFound(PathBuf),

    #[error("Database file not found: {0}")]
    MissingDatabase(PathBuf),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Unsupported secret key: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Backend(String),

    #[error("random source unavailable: {0}")]
    Random(String),
}
