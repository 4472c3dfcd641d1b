use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::CommandError;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// A short-lived helper command: version probes, installers, venv creation, pip.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Shell-like rendering used in logs and error reports.
    pub fn display(&self) -> String {
        let mut parts = vec![quote(&self.program)];
        parts.extend(self.args.iter().map(|arg| quote(arg)));
        parts.join(" ")
    }
}

fn quote(part: &str) -> String {
    if part.is_empty() || part.contains(char::is_whitespace) {
        format!("\"{part}\"")
    } else {
        part.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }

    /// Last `lines` lines of the combined output.
    pub fn tail(&self, lines: usize) -> String {
        let combined = self.combined();
        let all: Vec<&str> = combined.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Seam between the resolver/provisioner and the OS. Implementations must
/// enforce `spec.timeout` and never leave the command running afterwards.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        spec: &CommandSpec,
    ) -> impl Future<Output = Result<CommandOutput, CommandError>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = spec.cwd.as_ref() {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(source)) => Err(CommandError::Spawn {
                program: spec.program.clone(),
                source,
            }),
            // Dropping the future drops the child, and kill_on_drop reaps it.
            Err(_) => Err(CommandError::TimedOut {
                program: spec.program.clone(),
                timeout: spec.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_paths_with_spaces() {
        let spec = CommandSpec::new(r"C:\Program Files\Python311\python.exe", Duration::from_secs(1))
            .arg("--version");
        assert_eq!(
            spec.display(),
            r#""C:\Program Files\Python311\python.exe" --version"#
        );
    }

    #[test]
    fn tail_keeps_last_lines_of_combined_output() {
        let output = CommandOutput {
            code: Some(1),
            stdout: "one\ntwo\n".into(),
            stderr: "three\nfour\n".into(),
        };
        assert!(!output.success());
        assert_eq!(output.tail(2), "three\nfour");
        assert_eq!(output.tail(10), "one\ntwo\nthree\nfour");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_reports_exit_code_and_output() {
        let spec = CommandSpec::new("sh", Duration::from_secs(5))
            .args(["-c", "echo ready; echo oops >&2; exit 3"]);
        let output = SystemRunner.run(&spec).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "ready");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_times_out() {
        let spec = CommandSpec::new("sleep", Duration::from_millis(100)).arg("5");
        let err = SystemRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn system_runner_reports_missing_binary() {
        let spec = CommandSpec::new("ddt-definitely-not-installed", Duration::from_secs(1));
        let err = SystemRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
