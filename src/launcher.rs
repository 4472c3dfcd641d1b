use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::SpawnError;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(target_os = "windows")]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// `log` target for forwarded server output.
pub const SERVER_LOG_TARGET: &str = "server";

/// True for records carrying forwarded server output. File loggers use it to
/// keep server lines out of the desktop log, since they already have a file.
pub fn is_server_output(metadata: &log::Metadata) -> bool {
    metadata.target() == SERVER_LOG_TARGET
}

const MAX_LINE_BYTES: usize = 2048;
const DRAIN_SETTLE: Duration = Duration::from_millis(500);
/// How far back from the end of a redirected log the tail is read.
const REDIRECT_TAIL_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Own process group, no console window, survives the handle being dropped.
    /// Output goes straight to `log_file` (or nowhere) instead of through pipes,
    /// so the child never writes into a pipe nobody reads.
    pub detached: bool,
    pub ready_patterns: Vec<String>,
    pub log_tail_lines: usize,
    pub log_file: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Unresponsive,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Clone)]
struct DrainShared {
    tail: Arc<StdMutex<VecDeque<OutputLine>>>,
    tail_cap: usize,
    ready_tx: Arc<watch::Sender<bool>>,
    patterns: Arc<Vec<String>>,
    log_file: Option<Arc<Mutex<File>>>,
}

impl DrainShared {
    async fn push(&self, stream: OutputStream, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let line = truncate_line(text.trim_end_matches(['\r', '\n']));
        if line.trim().is_empty() {
            return;
        }

        match stream {
            OutputStream::Stdout => info!(target: SERVER_LOG_TARGET, "{line}"),
            OutputStream::Stderr => info!(target: SERVER_LOG_TARGET, "[stderr] {line}"),
        }

        if !*self.ready_tx.borrow() && self.patterns.iter().any(|p| line.contains(p.as_str())) {
            debug!("ready pattern seen in server output");
            self.ready_tx.send_replace(true);
        }

        if let Some(file) = self.log_file.as_ref() {
            let mut file = file.lock().await;
            let _ = file.write_all(format!("{line}\n").as_bytes()).await;
            let _ = file.flush().await;
        }

        let mut tail = match self.tail.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tail.push_back(OutputLine { stream, line });
        while tail.len() > self.tail_cap {
            tail.pop_front();
        }
    }
}

fn truncate_line(line: &str) -> String {
    if line.len() <= MAX_LINE_BYTES {
        return line.to_string();
    }
    let mut cut = MAX_LINE_BYTES;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &line[..cut])
}

/// Reads one line into `buf`, keeping at most `cap` bytes of it. The rest of
/// an over-long line is consumed and dropped. Returns `false` at end of stream.
async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>, cap: usize) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut seen_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(seen_any);
        }
        seen_any = true;
        let (used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(at) => (at + 1, true),
            None => (available.len(), false),
        };
        let room = cap.saturating_sub(buf.len());
        buf.extend_from_slice(&available[..used.min(room)]);
        reader.consume(used);
        if done {
            return Ok(true);
        }
    }
}

fn spawn_drain<S>(stream: S, kind: OutputStream, shared: DrainShared) -> JoinHandle<()>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(MAX_LINE_BYTES + 1);
        loop {
            // One byte over the cap so `truncate_line` marks the cut.
            match read_capped_line(&mut reader, &mut buf, MAX_LINE_BYTES + 1).await {
                Ok(false) => break,
                Ok(true) => shared.push(kind, &buf).await,
                Err(err) => {
                    debug!("server output stream closed: {err}");
                    break;
                }
            }
        }
    })
}

/// Opens the log file a detached child writes into directly. Returns the
/// file and the offset where this launch's output starts.
async fn open_redirect(path: &Path, header: &str) -> io::Result<(std::fs::File, u64)> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(format!("--- {header} ---\n").as_bytes()).await?;
    file.flush().await?;
    let offset = file.metadata().await?.len();
    Ok((file.into_std().await, offset))
}

/// Last `lines` non-empty lines written to `path` after `offset`.
fn read_log_tail(path: &Path, offset: u64, lines: usize) -> Vec<OutputLine> {
    let Ok(mut file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = offset.max(len.saturating_sub(REDIRECT_TAIL_BYTES));
    if start >= len || file.seek(SeekFrom::Start(start)).is_err() {
        return Vec::new();
    }
    let mut raw = Vec::new();
    if file.take(len - start).read_to_end(&mut raw).is_err() {
        return Vec::new();
    }
    let text = String::from_utf8_lossy(&raw);
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let from = all.len().saturating_sub(lines);
    all[from..]
        .iter()
        .map(|line| OutputLine {
            stream: OutputStream::Stdout,
            line: truncate_line(line),
        })
        .collect()
}

async fn open_log_file(path: &PathBuf, header: &str) -> Option<Arc<Mutex<File>>> {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(mut file) => {
            let _ = file.write_all(format!("--- {header} ---\n").as_bytes()).await;
            let _ = file.flush().await;
            Some(Arc::new(Mutex::new(file)))
        }
        Err(err) => {
            warn!("cannot open server log {}: {err}", path.display());
            None
        }
    }
}

/// Spawns the server. Output draining starts immediately.
pub async fn start(spec: LaunchSpec) -> Result<ServerProcessHandle, SpawnError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null());

    let mut redirect = None;
    if spec.detached {
        let opened = match spec.log_file.as_ref() {
            Some(path) => match open_redirect(path, &format!("detached: {}", spec.display())).await {
                Ok((file, offset)) => match file.try_clone() {
                    Ok(copy) => Some((file, copy, path.clone(), offset)),
                    Err(err) => {
                        warn!("cannot share server log {}: {err}", path.display());
                        None
                    }
                },
                Err(err) => {
                    warn!("cannot open server log {}: {err}", path.display());
                    None
                }
            },
            None => None,
        };
        match opened {
            Some((out, err, path, offset)) => {
                cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
                redirect = Some((path, offset));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
    } else {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    if spec.detached {
        cmd.kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    } else {
        cmd.kill_on_drop(true);
        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = cmd.spawn().map_err(|source| SpawnError {
        program: spec.program.clone(),
        source,
    })?;
    let pid = child.id().unwrap_or_default();
    info!(
        "server started (pid {pid}, {}): {}",
        if spec.detached { "detached" } else { "attached" },
        spec.display()
    );

    let log_file = match (spec.log_file.as_ref(), redirect.is_some()) {
        (Some(path), false) => open_log_file(path, &format!("pid {pid}: {}", spec.display())).await,
        _ => None,
    };
    let (ready_tx, _) = watch::channel(false);
    let shared = DrainShared {
        tail: Arc::new(StdMutex::new(VecDeque::with_capacity(spec.log_tail_lines))),
        tail_cap: spec.log_tail_lines.max(1),
        ready_tx: Arc::new(ready_tx),
        patterns: Arc::new(spec.ready_patterns.clone()),
        log_file,
    };

    let mut drains = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        drains.push(spawn_drain(stdout, OutputStream::Stdout, shared.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(spawn_drain(stderr, OutputStream::Stderr, shared.clone()));
    }

    Ok(ServerProcessHandle {
        pid,
        child,
        started_at: SystemTime::now(),
        state: ProcessState::Starting,
        detached: spec.detached,
        tail: shared.tail,
        tail_cap: shared.tail_cap,
        redirect,
        ready_tx: shared.ready_tx,
        drains,
        exit: None,
    })
}

/// The running server. Only the supervisor holds one.
pub struct ServerProcessHandle {
    pid: u32,
    child: Child,
    started_at: SystemTime,
    state: ProcessState,
    detached: bool,
    tail: Arc<StdMutex<VecDeque<OutputLine>>>,
    tail_cap: usize,
    /// Log file and start offset when a detached child writes there directly.
    redirect: Option<(PathBuf, u64)>,
    ready_tx: Arc<watch::Sender<bool>>,
    drains: Vec<JoinHandle<()>>,
    exit: Option<ExitStatus>,
}

impl ServerProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Flips to `true` once a ready pattern shows up in the output. Never
    /// flips for a detached child, whose output bypasses the readers.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn output_tail(&self) -> Vec<OutputLine> {
        if let Some((path, offset)) = self.redirect.as_ref() {
            return read_log_tail(path, *offset, self.tail_cap);
        }
        match self.tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Last `lines` stderr lines, or the last output lines if stderr was silent.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all = self.output_tail();
        let stderr: Vec<&str> = all
            .iter()
            .filter(|l| l.stream == OutputStream::Stderr)
            .map(|l| l.line.as_str())
            .collect();
        let picked: Vec<&str> = if stderr.is_empty() {
            all.iter().map(|l| l.line.as_str()).collect()
        } else {
            stderr
        };
        let start = picked.len().saturating_sub(lines);
        picked[start..].join("\n")
    }

    /// Non-blocking exit check.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.record_exit(status),
                Ok(None) => {}
                Err(err) => warn!("cannot poll server pid {}: {err}", self.pid),
            }
        }
        self.exit
    }

    /// Waits for the process to exit, then lets the output readers catch up so
    /// the tail includes the last lines written.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.record_exit(status);
        for drain in self.drains.drain(..) {
            let _ = tokio::time::timeout(DRAIN_SETTLE, drain).await;
        }
        Ok(status)
    }

    fn record_exit(&mut self, status: ExitStatus) {
        info!("server pid {} exited: {status}", self.pid);
        self.exit = Some(status);
        self.state = if status.success() {
            ProcessState::Stopped
        } else {
            ProcessState::Failed
        };
    }

    /// Polite stop by PID (process group when detached), then a forced kill
    /// once `grace` runs out.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        if self.poll_exit().is_none() {
            info!("stopping server pid {}", self.pid);
            if let Err(err) = self.signal(false).await {
                warn!("polite stop of pid {} failed: {err}", self.pid);
            }
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => self.record_exit(status),
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    warn!(
                        "server pid {} ignored stop for {}ms; killing",
                        self.pid,
                        grace.as_millis()
                    );
                    if let Err(err) = self.signal(true).await {
                        debug!("group kill of pid {} failed: {err}", self.pid);
                    }
                    let _ = self.child.start_kill();
                    let status = self.child.wait().await?;
                    self.record_exit(status);
                }
            }
        }
        self.state = ProcessState::Stopped;
        for drain in self.drains.drain(..) {
            drain.abort();
        }
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    async fn signal(&self, force: bool) -> io::Result<()> {
        let signal = if force { "-KILL" } else { "-TERM" };
        let pid = self.pid.to_string();
        let group = format!("-{pid}");
        let args: Vec<&str> = if self.detached {
            vec![signal, "--", group.as_str()]
        } else {
            vec![signal, pid.as_str()]
        };
        let status = Command::new("kill")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::Other, format!("kill exited with {status}")))
        }
    }

    #[cfg(target_os = "windows")]
    async fn signal(&self, force: bool) -> io::Result<()> {
        let pid = self.pid.to_string();
        let mut args = vec!["/PID", pid.as_str(), "/T"];
        if force {
            args.push("/F");
        }
        let status = Command::new("taskkill")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .creation_flags(CREATE_NO_WINDOW)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::Other, format!("taskkill exited with {status}")))
        }
    }
}

impl Drop for ServerProcessHandle {
    fn drop(&mut self) {
        for drain in &self.drains {
            drain.abort();
        }
    }
}
