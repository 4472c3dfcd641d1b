pub mod backup;
pub mod command;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod health;
pub mod launcher;
pub mod platform;
pub mod provision;
pub mod resolver;
pub mod secrets;
pub mod staging;
pub mod supervisor;

pub use command::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use config::SupervisorConfig;
pub use error::{SupervisorError, SupervisorErrorKind};
pub use supervisor::{ServerEndpoint, Supervisor, SupervisorState, SupervisorStatus};
