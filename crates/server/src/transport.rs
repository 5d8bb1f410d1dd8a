//! Child process transport
//!
//! Spawns the MCP server as a subprocess and talks to it over stdin/stdout
//! using newline-delimited JSON. Every complete stdout line is handed to a
//! [`LineSink`]; stderr is only ever logged. Writes are fire-and-forget
//! through a bounded queue drained by a dedicated writer task.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStderr, ChildStdout};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::truncate_for_log;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Receives each complete line read from the child's stdout.
pub trait LineSink: Send + Sync {
    fn on_line(&self, line: String);
}

/// Accepts lines destined for the child's stdin.
pub trait ChildWriter: Send + Sync {
    /// Queue one line (without terminator). Never blocks, never fails loudly.
    /// Returns false when the line was dropped.
    fn write_line(&self, line: String) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// 0 means retry forever
    pub max_attempts: u32,
}

impl Backoff {
    /// Delay before the `attempt`-th consecutive restart (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max)
            .min(self.max)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    Backoff(Backoff),
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildState {
    NotStarted,
    Running,
    Exited,
    SpawnFailed,
    /// Backoff ran out of attempts
    GaveUp,
}

/// Point-in-time view of the child, published lock-free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildStatus {
    pub state: ChildState,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub last_exit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartRequest {
    Accepted,
    AlreadyRunning,
    /// The supervisor has not spawned the first child yet
    NotStarted,
    /// An earlier request has not been picked up yet
    Pending,
    /// Policy does not allow on-demand restarts
    Disabled,
}

pub struct ProcessTransport {
    command: ChildCommand,
    policy: RestartPolicy,
    queue_capacity: usize,
    sink: Arc<dyn LineSink>,
    stdin_tx: ArcSwapOption<mpsc::Sender<String>>,
    status: ArcSwap<ChildStatus>,
    restarts: AtomicU32,
    restart_requested: Notify,
    restart_pending: AtomicBool,
}

impl ProcessTransport {
    pub fn new(
        command: ChildCommand,
        policy: RestartPolicy,
        queue_capacity: usize,
        sink: Arc<dyn LineSink>,
    ) -> Self {
        Self {
            command,
            policy,
            queue_capacity,
            sink,
            stdin_tx: ArcSwapOption::empty(),
            status: ArcSwap::from_pointee(ChildStatus {
                state: ChildState::NotStarted,
                pid: None,
                restarts: 0,
                last_exit: None,
            }),
            restarts: AtomicU32::new(0),
            restart_requested: Notify::new(),
            restart_pending: AtomicBool::new(false),
        }
    }

    /// Spawn the supervisor task that owns the child for its whole lifetime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move { transport.supervise().await })
    }

    pub fn status(&self) -> Arc<ChildStatus> {
        self.status.load_full()
    }

    pub fn is_writable(&self) -> bool {
        match &*self.stdin_tx.load() {
            Some(tx) => !tx.is_closed(),
            None => false,
        }
    }

    /// Ask a stopped child to be respawned (manual policy only).
    pub fn request_restart(&self) -> RestartRequest {
        if self.policy != RestartPolicy::Manual {
            return RestartRequest::Disabled;
        }
        match self.status().state {
            ChildState::Running => return RestartRequest::AlreadyRunning,
            ChildState::NotStarted => return RestartRequest::NotStarted,
            ChildState::Exited | ChildState::SpawnFailed | ChildState::GaveUp => {}
        }
        if self.restart_pending.swap(true, Ordering::AcqRel) {
            return RestartRequest::Pending;
        }
        info!(
            component = "transport",
            event = "child.restart.requested",
            "Manual child restart requested"
        );
        self.restart_requested.notify_one();
        RestartRequest::Accepted
    }

    async fn supervise(&self) {
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            match self.spawn_child() {
                Ok(spawned) => self.run_child(spawned).await,
                Err(e) => {
                    error!(
                        component = "transport",
                        event = "child.spawn_failed",
                        program = %self.command.program,
                        error = %e,
                        "Failed to spawn child process; forwarding is inert"
                    );
                    self.publish(ChildState::SpawnFailed, None, Some(e.to_string()));
                }
            }

            match self.policy {
                RestartPolicy::Never => {
                    info!(
                        component = "transport",
                        event = "child.restart.disabled",
                        "Child stopped and restart policy is none"
                    );
                    return;
                }
                RestartPolicy::Manual => {
                    self.restart_requested.notified().await;
                    self.restart_pending.store(false, Ordering::Release);
                }
                RestartPolicy::Backoff(backoff) => {
                    if started.elapsed() >= backoff.max {
                        attempt = 0;
                    }
                    attempt += 1;
                    if backoff.exhausted(attempt) {
                        error!(
                            component = "transport",
                            event = "child.restart.gave_up",
                            attempts = attempt - 1,
                            "Child kept failing, giving up on restarts"
                        );
                        let last_exit = self.status().last_exit.clone();
                        self.publish(ChildState::GaveUp, None, last_exit);
                        return;
                    }
                    let delay = backoff.delay_for(attempt);
                    warn!(
                        component = "transport",
                        event = "child.restart.scheduled",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Restarting child after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }

            self.restarts.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn spawn_child(&self) -> Result<SpawnedChild, TransportError> {
        info!(
            component = "transport",
            event = "child.spawn",
            program = %self.command.program,
            args = ?self.command.args,
            cwd = ?self.command.cwd,
            "Spawning child process"
        );

        let mut command = tokio::process::Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.command.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(TransportError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(TransportError::MissingPipe("stderr"))?;

        Ok(SpawnedChild {
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    async fn run_child(&self, spawned: SpawnedChild) {
        let SpawnedChild {
            mut child,
            stdin,
            stdout,
            stderr,
        } = spawned;
        let pid = child.id();

        info!(
            component = "transport",
            event = "child.started",
            pid = ?pid,
            "Child process started"
        );

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(self.queue_capacity);
        tokio::spawn(stdin_writer(stdin, stdin_rx));
        tokio::spawn(log_stderr(stderr));

        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = pump_lines(stdout, sink.as_ref()).await {
                error!(
                    component = "transport",
                    event = "child.stdout.read_error",
                    error = %e,
                    "Error reading child stdout"
                );
            }
        });

        self.stdin_tx.store(Some(Arc::new(stdin_tx)));
        self.publish(ChildState::Running, pid, None);

        let exit = match child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        };

        // Dropping the sender ends the writer task and closes the pipe.
        self.stdin_tx.store(None);

        warn!(
            component = "transport",
            event = "child.exited",
            pid = ?pid,
            exit = %exit,
            "Child process exited"
        );
        self.publish(ChildState::Exited, None, Some(exit));
    }

    fn publish(&self, state: ChildState, pid: Option<u32>, last_exit: Option<String>) {
        self.status.store(Arc::new(ChildStatus {
            state,
            pid,
            restarts: self.restarts.load(Ordering::Relaxed),
            last_exit,
        }));
    }
}

impl ChildWriter for ProcessTransport {
    fn write_line(&self, line: String) -> bool {
        let guard = self.stdin_tx.load();
        let Some(tx) = &*guard else {
            warn!(
                component = "transport",
                event = "child.write.inert",
                payload_bytes = line.len(),
                "Child is not running, dropping line"
            );
            return false;
        };

        match tx.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(line)) => {
                warn!(
                    component = "transport",
                    event = "child.write.queue_full",
                    payload_preview = %truncate_for_log(&line, 120),
                    "Child stdin queue full, dropping line"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(
                    component = "transport",
                    event = "child.write.closed",
                    "Child stdin closed, dropping line"
                );
                false
            }
        }
    }
}

struct SpawnedChild {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

/// Dedicated stdin writer task: drains the channel into the child stdin.
async fn stdin_writer(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "transport",
                event = "child.stdin.write_error",
                error = %e,
                "Failed to write to child stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "transport",
                event = "child.stdin.flush_error",
                error = %e,
                "Failed to flush child stdin"
            );
            break;
        }
    }
    debug!(
        component = "transport",
        event = "child.stdin.closed",
        "Stdin writer task ended"
    );
}

async fn log_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(trim_line_ending(&buf));
                debug!(
                    component = "transport",
                    event = "child.stderr",
                    line = %line,
                    "Child stderr"
                );
            }
            Err(e) => {
                warn!(
                    component = "transport",
                    event = "child.stderr.read_error",
                    error = %e,
                    "Error reading child stderr"
                );
                break;
            }
        }
    }
}

fn trim_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

/// Split `reader` into lines and hand each non-blank one to `sink`.
///
/// Partial reads stay buffered until a newline arrives; whatever is left
/// when the stream ends is delivered as a final line. Lines that are not
/// UTF-8 are logged and skipped.
pub(crate) async fn pump_lines<R>(reader: R, sink: &dyn LineSink) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = match std::str::from_utf8(trim_line_ending(&buf)) {
            Ok(line) => line,
            Err(e) => {
                warn!(
                    component = "transport",
                    event = "child.stdout.invalid_utf8",
                    error = %e,
                    payload_bytes = buf.len(),
                    "Skipping child output line that is not UTF-8"
                );
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        debug!(
            component = "transport",
            event = "child.stdout.line",
            payload_bytes = line.len(),
            "Child output line"
        );
        sink.on_line(line.to_string());
    }
    info!(
        component = "transport",
        event = "child.stdout.eof",
        "Child stdout EOF"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct CollectingSink {
        lines: Mutex<Vec<String>>,
    }

    impl CollectingSink {
        fn lines(&self) -> Vec<String> {
            self.lines.lock().expect("sink lock").clone()
        }
    }

    impl LineSink for CollectingSink {
        fn on_line(&self, line: String) {
            self.lines.lock().expect("sink lock").push(line);
        }
    }

    fn command(program: &str, args: &[&str]) -> ChildCommand {
        ChildCommand {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn frames_lines_across_partial_reads() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let sink = CollectingSink::default();

        let feed = tokio::spawn(async move {
            writer.write_all(b"{\"id\":1,").await.expect("write");
            tokio::task::yield_now().await;
            writer.write_all(b"\"result\":{}}\n{\"id\"").await.expect("write");
            tokio::task::yield_now().await;
            writer.write_all(b":2}\n\n   \n{\"tail\":true}").await.expect("write");
        });

        pump_lines(reader, &sink).await.expect("pump");
        feed.await.expect("feed task");

        assert_eq!(
            sink.lines(),
            vec![
                r#"{"id":1,"result":{}}"#.to_string(),
                r#"{"id":2}"#.to_string(),
                r#"{"tail":true}"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn skips_non_utf8_lines_and_keeps_reading() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let sink = CollectingSink::default();

        let feed = tokio::spawn(async move {
            writer
                .write_all(b"{\"a\":1}\n\xff\xfe\n{\"ok\":1}\r\n")
                .await
                .expect("write");
        });

        pump_lines(reader, &sink).await.expect("pump");
        feed.await.expect("feed task");

        assert_eq!(
            sink.lines(),
            vec![r#"{"a":1}"#.to_string(), r#"{"ok":1}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn stderr_never_reaches_the_sink() {
        let sink = Arc::new(CollectingSink::default());
        // Enough stderr to fill the pipe, starting with bytes that are not UTF-8
        let script = r#"printf '\377\376\n' >&2; i=0; while [ $i -lt 2000 ]; do echo "noise line $i with some padding text" >&2; i=$((i+1)); done; echo '{"ok":1}'"#;
        let transport = Arc::new(ProcessTransport::new(
            command("sh", &["-c", script]),
            RestartPolicy::Never,
            4,
            sink.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(10), transport.start())
            .await
            .expect("child exits")
            .expect("supervisor task");

        assert_eq!(transport.status().state, ChildState::Exited);
        assert!(wait_for(|| !sink.lines().is_empty()).await);
        assert_eq!(sink.lines(), vec![r#"{"ok":1}"#.to_string()]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            max_attempts: 3,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(1000));
        assert!(!backoff.exhausted(3));
        assert!(backoff.exhausted(4));

        let forever = Backoff {
            max_attempts: 0,
            ..backoff
        };
        assert!(!forever.exhausted(u32::MAX));
    }

    #[tokio::test]
    async fn writes_are_inert_before_start() {
        let sink = Arc::new(CollectingSink::default());
        let transport =
            ProcessTransport::new(command("cat", &[]), RestartPolicy::Never, 4, sink.clone());

        assert!(!transport.write_line(r#"{"jsonrpc":"2.0","method":"ping"}"#.to_string()));

        assert!(!transport.is_writable());
        assert_eq!(transport.status().state, ChildState::NotStarted);
        assert!(sink.lines().is_empty());
    }

    #[tokio::test]
    async fn relays_lines_through_child() {
        let sink = Arc::new(CollectingSink::default());
        let transport = Arc::new(ProcessTransport::new(
            command("cat", &[]),
            RestartPolicy::Never,
            16,
            sink.clone(),
        ));
        let _supervisor = transport.start();

        assert!(wait_for(|| transport.is_writable()).await);
        assert_eq!(transport.status().state, ChildState::Running);

        assert!(transport.write_line(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#.to_string()));

        assert!(wait_for(|| !sink.lines().is_empty()).await);
        assert_eq!(
            sink.lines(),
            vec![r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn spawn_failure_leaves_transport_inert() {
        let sink = Arc::new(CollectingSink::default());
        let transport = Arc::new(ProcessTransport::new(
            command("/nonexistent/mcp-server-binary", &[]),
            RestartPolicy::Never,
            4,
            sink,
        ));

        transport.start().await.expect("supervisor task");

        assert_eq!(transport.status().state, ChildState::SpawnFailed);
        assert!(!transport.is_writable());
        assert!(!transport.write_line("{}".to_string()));
        assert_eq!(transport.request_restart(), RestartRequest::Disabled);
    }

    #[tokio::test]
    async fn exited_child_is_reported() {
        let sink = Arc::new(CollectingSink::default());
        let transport = Arc::new(ProcessTransport::new(
            command("sh", &["-c", "echo '{\"ready\":true}'"]),
            RestartPolicy::Never,
            4,
            sink.clone(),
        ));

        transport.start().await.expect("supervisor task");

        assert_eq!(transport.status().state, ChildState::Exited);
        assert!(transport.status().last_exit.is_some());
        assert!(wait_for(|| sink.lines().len() == 1).await);
        assert_eq!(sink.lines(), vec![r#"{"ready":true}"#.to_string()]);
    }

    #[tokio::test]
    async fn manual_policy_respawns_on_request() {
        let sink = Arc::new(CollectingSink::default());
        let transport = Arc::new(ProcessTransport::new(
            command("sh", &["-c", "echo '{\"boot\":1}'"]),
            RestartPolicy::Manual,
            4,
            sink.clone(),
        ));
        let _supervisor = transport.start();

        assert!(wait_for(|| transport.status().state == ChildState::Exited).await);
        assert_eq!(transport.request_restart(), RestartRequest::Accepted);

        assert!(wait_for(|| sink.lines().len() == 2).await);
        assert!(wait_for(|| transport.status().restarts == 1).await);
    }

    #[tokio::test]
    async fn restart_before_first_spawn_is_refused() {
        let sink = Arc::new(CollectingSink::default());
        let transport = Arc::new(ProcessTransport::new(
            command("sh", &["-c", "echo '{\"boot\":1}'"]),
            RestartPolicy::Manual,
            4,
            sink.clone(),
        ));

        assert_eq!(transport.request_restart(), RestartRequest::NotStarted);
        let _supervisor = transport.start();

        assert!(wait_for(|| transport.status().state == ChildState::Exited).await);
        assert!(wait_for(|| sink.lines().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = transport.status();
        assert_eq!(status.state, ChildState::Exited);
        assert_eq!(status.restarts, 0);
        assert_eq!(sink.lines(), vec![r#"{"boot":1}"#.to_string()]);
    }

    #[tokio::test]
    async fn backoff_policy_gives_up_after_max_attempts() {
        let sink = Arc::new(CollectingSink::default());
        let transport = Arc::new(ProcessTransport::new(
            command("/nonexistent/mcp-server-binary", &[]),
            RestartPolicy::Backoff(Backoff {
                initial: Duration::from_millis(1),
                max: Duration::from_secs(5),
                max_attempts: 2,
            }),
            4,
            sink,
        ));

        transport.start().await.expect("supervisor task");

        let status = transport.status();
        assert_eq!(status.state, ChildState::GaveUp);
        assert_eq!(status.restarts, 2);
    }
}
