//! Table of launched command subprocesses.
//!
//! Each process is owned by a supervisor task that waits for it to exit or
//! for a termination request, whichever comes first. Stdout and stderr are
//! captured line by line into a bounded buffer and fanned out to live
//! subscribers.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use super::errors::LauncherError;
use crate::process::{terminate_child, Termination};

/// Lines kept per process; older lines are dropped first.
const MAX_OUTPUT_LINES: usize = 5_000;

/// Capacity of the live output channel per process.
const LIVE_BUFFER: usize = 256;

/// How long an exited process stays listed before it is dropped.
pub const EXITED_RETENTION: Duration = Duration::from_secs(600);

/// How long to wait for output readers after the process exits.
const READER_DRAIN: Duration = Duration::from_secs(1);

type KillReply = oneshot::Sender<std::io::Result<Termination>>;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Body of a launch request.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Summary of one tracked process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub process_id: String,
    pub command: String,
    pub args: Vec<String>,
    /// `running` or `terminated (code: N)`.
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub pid: Option<u32>,
}

/// Summary plus captured output.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessDetail {
    #[serde(flatten)]
    pub info: ProcessInfo,
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One event on a process's output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProcessEvent {
    Stdout { data: String },
    Stderr { data: String },
    Exit { code: i32 },
}

impl ProcessEvent {
    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessEvent::Stdout { .. } => "stdout",
            ProcessEvent::Stderr { .. } => "stderr",
            ProcessEvent::Exit { .. } => "exit",
        }
    }
}

// ─── Internals ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct OutputLine {
    seq: u64,
    stream: OutputStream,
    line: String,
}

impl OutputLine {
    fn into_event(self) -> ProcessEvent {
        match self.stream {
            OutputStream::Stdout => ProcessEvent::Stdout { data: self.line },
            OutputStream::Stderr => ProcessEvent::Stderr { data: self.line },
        }
    }
}

#[derive(Debug, Default)]
struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    next_seq: u64,
}

struct ManagedProcess {
    id: String,
    command: String,
    args: Vec<String>,
    start_time: DateTime<Utc>,
    pid: Option<u32>,
    output: Mutex<OutputBuffer>,
    /// Live fan-out; `None` once every reader has finished.
    live: Mutex<Option<broadcast::Sender<OutputLine>>>,
    exit: watch::Receiver<Option<i32>>,
    exited_at: Mutex<Option<Instant>>,
    kill_tx: mpsc::Sender<KillReply>,
}

impl ManagedProcess {
    fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    fn info(&self) -> ProcessInfo {
        let status = match self.exit_code() {
            None => "running".to_string(),
            Some(code) => format!("terminated (code: {code})"),
        };
        ProcessInfo {
            process_id: self.id.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            status,
            start_time: self.start_time,
            pid: self.pid,
        }
    }

    /// Exited longer than `retention` ago.
    fn expired(&self, retention: Duration) -> bool {
        match *self.exited_at.lock().unwrap_or_else(|p| p.into_inner()) {
            Some(at) => at.elapsed() >= retention,
            None => false,
        }
    }

    fn output(&self) -> MutexGuard<'_, OutputBuffer> {
        self.output.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, stream: OutputStream, line: String) {
        let entry = {
            let mut buf = self.output();
            let entry = OutputLine {
                seq: buf.next_seq,
                stream,
                line,
            };
            buf.next_seq += 1;
            if buf.lines.len() == MAX_OUTPUT_LINES {
                buf.lines.pop_front();
            }
            buf.lines.push_back(entry.clone());
            entry
        };
        if let Ok(live) = self.live.lock() {
            if let Some(tx) = live.as_ref() {
                let _ = tx.send(entry);
            }
        }
    }
}

// ─── Process Table ───────────────────────────────────────────────────────────

/// Launched processes by id. Independent of any provider connection.
///
/// Processes that exit on their own stay queryable for a retention period,
/// then drop out on the next `spawn` or `list`.
pub struct ProcessTable {
    processes: Mutex<HashMap<String, Arc<ManagedProcess>>>,
    grace: Duration,
    retention: Duration,
}

impl ProcessTable {
    /// `grace` is the wait between SIGTERM and SIGKILL on termination.
    pub fn new(grace: Duration) -> Self {
        Self::with_retention(grace, EXITED_RETENTION)
    }

    pub fn with_retention(grace: Duration, retention: Duration) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            grace,
            retention,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<ManagedProcess>>> {
        self.processes.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn find(&self, id: &str) -> Result<Arc<ManagedProcess>, LauncherError> {
        self.table()
            .get(id)
            .cloned()
            .ok_or_else(|| LauncherError::NotFound { id: id.to_string() })
    }

    fn prune(&self) {
        let mut table = self.table();
        let before = table.len();
        table.retain(|_, process| !process.expired(self.retention));
        let dropped = before - table.len();
        if dropped > 0 {
            tracing::debug!(dropped, "pruned exited processes");
        }
    }

    /// Start `request.command` with piped output. Must run inside a Tokio runtime.
    pub fn spawn(&self, request: LaunchRequest) -> Result<ProcessInfo, LauncherError> {
        self.prune();

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| LauncherError::Spawn {
            command: request.command.clone(),
            source,
        })?;

        let id = uuid::Uuid::new_v4().to_string();
        let (live_tx, _) = broadcast::channel(LIVE_BUFFER);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::channel(1);

        let process = Arc::new(ManagedProcess {
            id: id.clone(),
            command: request.command,
            args: request.args,
            start_time: Utc::now(),
            pid: child.id(),
            output: Mutex::new(OutputBuffer::default()),
            live: Mutex::new(Some(live_tx)),
            exit: exit_rx,
            exited_at: Mutex::new(None),
            kill_tx,
        });

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let reader = capture(Arc::clone(&process), OutputStream::Stdout, stdout);
            readers.push(tokio::spawn(reader));
        }
        if let Some(stderr) = child.stderr.take() {
            let reader = capture(Arc::clone(&process), OutputStream::Stderr, stderr);
            readers.push(tokio::spawn(reader));
        }

        tokio::spawn(supervise(
            Arc::clone(&process),
            child,
            readers,
            kill_rx,
            exit_tx,
            self.grace,
        ));

        tracing::info!(
            process_id = %id,
            command = %process.command,
            args = ?process.args,
            pid = ?process.pid,
            "process started"
        );

        let info = process.info();
        self.table().insert(id, process);
        Ok(info)
    }

    /// Every tracked process, oldest first.
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.prune();
        let mut infos: Vec<ProcessInfo> = self.table().values().map(|p| p.info()).collect();
        infos.sort_by_key(|info| info.start_time);
        infos
    }

    /// Info plus the captured output so far.
    pub fn get(&self, id: &str) -> Result<ProcessDetail, LauncherError> {
        let process = self.find(id)?;
        let (stdout, stderr) = {
            let buf = process.output();
            let join = |stream: OutputStream| {
                buf.lines
                    .iter()
                    .filter(|l| l.stream == stream)
                    .map(|l| l.line.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            (join(OutputStream::Stdout), join(OutputStream::Stderr))
        };
        Ok(ProcessDetail {
            info: process.info(),
            return_code: process.exit_code(),
            stdout,
            stderr,
        })
    }

    /// Wait for the process to exit and return its code.
    pub async fn wait(&self, id: &str) -> Result<i32, LauncherError> {
        let process = self.find(id)?;
        let mut exit = process.exit.clone();
        loop {
            if let Some(code) = *exit.borrow_and_update() {
                return Ok(code);
            }
            if exit.changed().await.is_err() {
                return Ok(process.exit_code().unwrap_or(-1));
            }
        }
    }

    /// Captured output, then live output, then one `Exit` event.
    pub fn events(&self, id: &str) -> Result<BoxStream<'static, ProcessEvent>, LauncherError> {
        let process = self.find(id)?;

        // Subscribe before the snapshot so no line falls in between.
        let live = match process.live.lock() {
            Ok(guard) => guard.as_ref().map(broadcast::Sender::subscribe),
            Err(_) => None,
        };
        let snapshot: Vec<OutputLine> = process.output().lines.iter().cloned().collect();
        let next_seq = snapshot.last().map_or(0, |l| l.seq + 1);

        let replay = stream::iter(snapshot.into_iter().map(OutputLine::into_event));

        let live = match live {
            Some(rx) => BroadcastStream::new(rx)
                .filter_map(move |item| async move {
                    match item {
                        Ok(line) if line.seq >= next_seq => Some(line.into_event()),
                        _ => None,
                    }
                })
                .boxed(),
            None => stream::empty().boxed(),
        };

        let mut exit = process.exit.clone();
        let exit_event = stream::once(async move {
            let code = loop {
                if let Some(code) = *exit.borrow_and_update() {
                    break code;
                }
                if exit.changed().await.is_err() {
                    break exit.borrow().unwrap_or(-1);
                }
            };
            ProcessEvent::Exit { code }
        });

        Ok(replay.chain(live).chain(exit_event).boxed())
    }

    /// Terminate (SIGTERM, grace, SIGKILL) and forget the process.
    pub async fn terminate(&self, id: &str) -> Result<Termination, LauncherError> {
        let process = self.find(id)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let outcome = if process.kill_tx.send(reply_tx).await.is_err() {
            Ok(Termination::AlreadyExited)
        } else {
            reply_rx.await.unwrap_or(Ok(Termination::AlreadyExited))
        };

        let termination = outcome.map_err(|e| LauncherError::Terminate {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        self.table().remove(id);
        tracing::info!(process_id = %id, outcome = ?termination, "process terminated");
        Ok(termination)
    }

    /// Terminate every tracked process.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.table().keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "terminating all launched processes");
        let results = futures::future::join_all(ids.iter().map(|id| self.terminate(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(process_id = %id, error = %e, "failed to terminate");
            }
        }
    }
}

// ─── Tasks ───────────────────────────────────────────────────────────────────

async fn capture<R>(process: Arc<ManagedProcess>, stream: OutputStream, pipe: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => process.record(stream, line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(process_id = %process.id, error = %e, "output read failed");
                break;
            }
        }
    }
}

async fn supervise(
    process: Arc<ManagedProcess>,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    mut kill_rx: mpsc::Receiver<KillReply>,
    exit_tx: watch::Sender<Option<i32>>,
    grace: Duration,
) {
    let kill_request = tokio::select! {
        _ = child.wait() => None,
        Some(reply) = kill_rx.recv() => Some(reply),
    };

    if let Some(reply) = kill_request {
        let _ = reply.send(terminate_child(&mut child, grace).await);
    }

    let code = match child.wait().await {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::warn!(process_id = %process.id, error = %e, "failed to reap process");
            -1
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    if let Ok(mut live) = process.live.lock() {
        live.take();
    }
    if let Ok(mut exited_at) = process.exited_at.lock() {
        *exited_at = Some(Instant::now());
    }
    exit_tx.send_replace(Some(code));
    tracing::info!(process_id = %process.id, code, "process exited");
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

// ─── Tests ───────────────────────────────────────────────────────────────────
