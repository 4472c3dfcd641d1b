//! Fixtures shared by the integration tests: a scripted command runner,
//! throwaway HTTP endpoints and, on Unix, a fake server environment.
#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ddt_manager::command::{CommandOutput, CommandRunner, CommandSpec};
use ddt_manager::error::CommandError;
use ddt_manager::platform::Platform;
use ddt_manager::provision::ProvisionSettings;
use ddt_manager::resolver::FallbackPolicy;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

type Handler = dyn Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync;

/// Records every command and answers through `handler` instead of the OS.
#[derive(Clone)]
pub struct FakeRunner {
    calls: Arc<Mutex<Vec<CommandSpec>>>,
    handler: Arc<Handler>,
}

impl FakeRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
    {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            handler: Arc::new(handler),
        }
    }

    pub fn healthy() -> Self {
        Self::new(healthy_python)
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Rendered command lines, in call order.
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.lines().iter().filter(|line| line.contains(needle)).count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(spec.clone());
        (self.handler)(spec)
    }
}

pub fn ok(stdout: &str) -> Result<CommandOutput, CommandError> {
    Ok(CommandOutput {
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

pub fn failed(code: i32, stderr: &str) -> Result<CommandOutput, CommandError> {
    Ok(CommandOutput {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

pub fn missing(spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
    Err(CommandError::Spawn {
        program: spec.program.clone(),
        source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
    })
}

/// A host where every interpreter works and the framework imports.
pub fn healthy_python(spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
    let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["--version"] if is_pip(&spec.program) => {
            ok("pip 24.0 from /venv/lib/python3.11/site-packages/pip (python 3.11)")
        }
        ["--version"] => ok("Python 3.11.9"),
        ["-m", "venv", dir] => {
            std::fs::create_dir_all(Path::new(dir).join("bin")).unwrap();
            ok("")
        }
        ["install", "-r", _] => ok("Successfully installed Django-5.0.4"),
        ["-c", _] => ok("5.0.4\n"),
        _ => ok(""),
    }
}

fn is_pip(program: &str) -> bool {
    Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().starts_with("pip"))
        .unwrap_or(false)
}

pub fn provision_settings(root: &Path) -> ProvisionSettings {
    ProvisionSettings {
        platform: Platform::Linux,
        env_dir: root.join("venv"),
        manifest: root.join("requirements.txt"),
        framework_module: "django".to_string(),
        interpreter_override: None,
        fallback: FallbackPolicy::FailFast,
        auto_install: false,
        probe_timeout: Duration::from_secs(1),
        install_timeout: Duration::from_secs(5),
        os_release: root.join("os-release"),
    }
}

/// Answers every request with `status_line` (e.g. "503 Service Unavailable").
pub async fn http_server(status_line: &'static str) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (port, task)
}

/// Accepts connections and drops them without answering.
pub async fn silent_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });
    (port, task)
}

/// Accepts connections, reads the request and holds the socket open without
/// ever writing a response.
pub async fn hanging_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(socket);
            });
        }
    });
    (port, task)
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Banner printed by the web framework's development server.
pub const READY_BANNER: &str = "echo 'Quit the server with CONTROL-C.'";

/// A provisioned environment whose `python3` is a shell script. Every launch
/// appends a line to `spawn_log`.
#[cfg(unix)]
pub struct ServerFixture {
    pub dir: tempfile::TempDir,
    pub config: ddt_manager::SupervisorConfig,
    pub runner: FakeRunner,
    pub spawn_log: PathBuf,
}

#[cfg(unix)]
impl ServerFixture {
    pub async fn new(server_body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let spawn_log = root.join("spawns.log");
        write_script(
            &root.join("venv/bin/python3"),
            &format!("echo spawn >> \"$DDT_SPAWN_LOG\"\n{server_body}"),
        );
        std::fs::create_dir_all(root.join("server")).unwrap();

        let mut config = ddt_manager::SupervisorConfig {
            port: closed_port().await,
            server_dir: root.join("server"),
            env_dir: root.join("venv"),
            auto_install: false,
            startup_timeout_ms: 10_000,
            poll_interval_ms: 50,
            probe_timeout_ms: 200,
            stop_grace_ms: 1_000,
            version_probe_timeout_ms: 1_000,
            server_log: Some(root.join("logs/server.log")),
            os_release: root.join("os-release"),
            ..ddt_manager::SupervisorConfig::default()
        };
        config
            .extra_env
            .insert("DDT_SPAWN_LOG".into(), spawn_log.to_string_lossy().to_string());

        Self {
            dir,
            config,
            runner: FakeRunner::healthy(),
            spawn_log,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn supervisor(&self) -> ddt_manager::Supervisor<FakeRunner> {
        ddt_manager::Supervisor::new(self.config.clone(), self.runner.clone()).unwrap()
    }

    pub fn spawn_count(&self) -> usize {
        std::fs::read_to_string(&self.spawn_log)
            .map(|text| text.lines().count())
            .unwrap_or(0)
    }
}
