//! One live agent conversation bound to one subprocess.
//!
//! [`AgentSession`] spawns the agent CLI with piped standard streams, frames
//! its stdout into protocol records, and re-emits them as typed
//! [`SessionEvent`]s on an unbounded channel. stderr is drained to diagnostic
//! events and the process exit is reported with its code/signal.
//!
//! Recovery (overflow restart, fatal-exit teardown) is the manager's job; a
//! session never retries anything on its own.

mod error;

pub use error::{SessionError, SessionResult};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{RwLock, mpsc, oneshot};

use ottr_protocol::{
    AgentRecord, ContentBlock, LineFramer, SESSION_ID_PLACEHOLDER, UserRecord, decode_line,
};

/// How to launch the agent CLI.
///
/// The default invocation runs the agent non-interactively with bidirectional
/// stream-JSON and approval prompts disabled; the process is assumed to run
/// inside a disposable sandbox.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn to_tokio(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.env);
        cmd
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self::new("claude").with_args([
            "-p",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
        ])
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process spawned, no output record seen yet.
    Starting,
    /// Waiting for input.
    Ready,
    /// An input record has been sent and its `result` has not arrived.
    Busy,
    /// Stopped or exited.
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Typed events re-emitted from the subprocess's output streams.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A `text` content block from an `assistant` record.
    TextDelta { text: String },
    /// A `tool_use` content block from an `assistant` record.
    ToolUse { name: String, input: Value },
    /// The terminal `result` record for one turn.
    TurnResult { text: String, is_error: bool },
    /// One stderr line; never fatal on its own.
    Diagnostic { line: String },
    /// The subprocess exited. Always the final event.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// One live agent conversation bound to one subprocess.
pub struct AgentSession {
    conversation_key: String,
    command: AgentCommand,
    state: Arc<RwLock<SessionState>>,
    remote_session_id: Arc<RwLock<String>>,
    alive: Arc<AtomicBool>,
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
}

impl AgentSession {
    pub fn new(conversation_key: impl Into<String>, command: AgentCommand) -> Self {
        Self {
            conversation_key: conversation_key.into(),
            command,
            state: Arc::new(RwLock::new(SessionState::Starting)),
            remote_session_id: Arc::new(RwLock::new(SESSION_ID_PLACEHOLDER.to_string())),
            alive: Arc::new(AtomicBool::new(false)),
            stdin: None,
            kill_tx: None,
            pid: None,
        }
    }

    pub fn conversation_key(&self) -> &str {
        &self.conversation_key
    }

    /// Spawn the subprocess and wire up its streams.
    ///
    /// Returns the event channel; the process is live after return, though no
    /// record has necessarily arrived yet. Any previous run is hard-stopped
    /// first.
    pub async fn start(&mut self) -> SessionResult<mpsc::UnboundedReceiver<SessionEvent>> {
        self.stop().await;

        let mut cmd = self.command.to_tokio();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(SessionError::Spawn)?;
        let pid = child.id();
        info!(
            "agent[{}] spawned {} (pid={:?})",
            self.conversation_key, self.command.program, pid
        );

        let stdin = child.stdin.take().ok_or_else(|| {
            SessionError::Spawn(std::io::Error::other("agent stdin not captured"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SessionError::Spawn(std::io::Error::other("agent stdout not captured"))
        })?;
        let stderr = child.stderr.take();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        self.state = Arc::new(RwLock::new(SessionState::Starting));
        self.remote_session_id = Arc::new(RwLock::new(SESSION_ID_PLACEHOLDER.to_string()));
        self.alive = Arc::new(AtomicBool::new(true));
        self.stdin = Some(stdin);
        self.kill_tx = Some(kill_tx);
        self.pid = pid;

        // stdout reader: framing + decoding into typed events.
        let stdout_handle = {
            let key = self.conversation_key.clone();
            let events = event_tx.clone();
            let state = Arc::clone(&self.state);
            let remote = Arc::clone(&self.remote_session_id);
            tokio::spawn(async move {
                Self::stdout_reader(key, stdout, events, state, remote).await;
            })
        };

        // stderr reader: diagnostic lines only.
        let stderr_handle = stderr.map(|stderr| {
            let key = self.conversation_key.clone();
            let events = event_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    debug!("agent[{key}] stderr: {line}");
                    let _ = events.send(SessionEvent::Diagnostic { line });
                }
            })
        });

        // Exit watch: owns the child, reaps it, and emits the final event.
        // A kill signal (or the session being dropped, which closes kill_tx)
        // escalates to SIGKILL before reaping. Both stream readers are
        // awaited before the exit event so `Exited` never overtakes output
        // the process wrote before dying.
        {
            let key = self.conversation_key.clone();
            let state = Arc::clone(&self.state);
            let alive = Arc::clone(&self.alive);
            tokio::spawn(async move {
                let waited = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = &mut kill_rx => None,
                };
                let status = match waited {
                    Some(status) => status,
                    None => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };

                let _ = stdout_handle.await;
                if let Some(handle) = stderr_handle {
                    let _ = handle.await;
                }

                alive.store(false, Ordering::SeqCst);
                *state.write().await = SessionState::Terminated;

                let (code, signal) = decompose_exit(status);
                debug!("agent[{key}] {}", format_exit_status(code, signal));
                let _ = event_tx.send(SessionEvent::Exited { code, signal });
            });
        }

        Ok(event_rx)
    }

    /// Send one user turn to the subprocess.
    ///
    /// Encodes a `user` record embedding `text` and the current remote
    /// session id (placeholder until the agent assigns one), writes it as a
    /// single line, and marks the session busy.
    pub async fn send(&mut self, text: &str) -> SessionResult<()> {
        let state = Arc::clone(&self.state);
        {
            let current = *state.read().await;
            match current {
                SessionState::Terminated => return Err(SessionError::NotStarted),
                SessionState::Busy => return Err(SessionError::Busy),
                SessionState::Starting | SessionState::Ready => {}
            }
        }
        let stdin = self.stdin.as_mut().ok_or(SessionError::NotStarted)?;

        let session_id = self.remote_session_id.read().await.clone();
        let mut line = serde_json::to_string(&UserRecord::new(text, &session_id))?;
        line.push('\n');

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(SessionError::Stdin)?;
        stdin.flush().await.map_err(SessionError::Stdin)?;

        *state.write().await = SessionState::Busy;
        Ok(())
    }

    /// True iff started and the subprocess has not exited.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// True iff a turn is outstanding.
    pub async fn is_busy(&self) -> bool {
        *self.state.read().await == SessionState::Busy
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// The identifier the agent assigned to this conversation, or the
    /// placeholder if none has arrived yet.
    pub async fn remote_session_id(&self) -> String {
        self.remote_session_id.read().await.clone()
    }

    /// Hard stop: signal the subprocess and clear session state immediately.
    ///
    /// Does not wait for graceful shutdown; reaping happens in the exit-watch
    /// task. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            if let Some(pid) = self.pid {
                debug!("agent[{}] stopping (pid={pid})", self.conversation_key);
            }
            let _ = tx.send(());
        }
        self.stdin = None;
        self.pid = None;
        self.alive.store(false, Ordering::SeqCst);
        *self.state.write().await = SessionState::Terminated;
        *self.remote_session_id.write().await = SESSION_ID_PLACEHOLDER.to_string();
    }

    /// Background task: read stdout, frame lines, decode records, emit events.
    async fn stdout_reader(
        key: String,
        mut stdout: ChildStdout,
        events: mpsc::UnboundedSender<SessionEvent>,
        state: Arc<RwLock<SessionState>>,
        remote: Arc<RwLock<String>>,
    ) {
        let mut framer = LineFramer::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("agent[{key}] stdout read error: {e}");
                    break;
                }
            };
            for line in framer.push(&buf[..n]) {
                let Some(record) = decode_line(&line) else {
                    debug!("agent[{key}] skipping non-record line: {line}");
                    continue;
                };
                Self::dispatch_record(&key, record, &events, &state, &remote).await;
            }
        }
    }

    async fn dispatch_record(
        key: &str,
        record: AgentRecord,
        events: &mpsc::UnboundedSender<SessionEvent>,
        state: &Arc<RwLock<SessionState>>,
        remote: &Arc<RwLock<String>>,
    ) {
        // Capture the agent-assigned session id from the first record that
        // carries a non-placeholder value.
        if let Some(id) = record.session_id()
            && id != SESSION_ID_PLACEHOLDER
        {
            let mut remote = remote.write().await;
            if *remote == SESSION_ID_PLACEHOLDER {
                debug!("agent[{key}] remote session id: {id}");
                *remote = id.to_string();
            }
        }

        // First record means the process is up.
        {
            let mut st = state.write().await;
            if *st == SessionState::Starting {
                *st = SessionState::Ready;
            }
        }

        match record {
            AgentRecord::System { .. } | AgentRecord::Unknown => {}
            AgentRecord::Assistant { message, .. } => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            let _ = events.send(SessionEvent::TextDelta { text });
                        }
                        ContentBlock::ToolUse { name, input } => {
                            let _ = events.send(SessionEvent::ToolUse { name, input });
                        }
                        ContentBlock::Unknown => {}
                    }
                }
            }
            AgentRecord::Result {
                result, is_error, ..
            } => {
                // Busy -> Ready exactly once per result record.
                {
                    let mut st = state.write().await;
                    if *st == SessionState::Busy {
                        *st = SessionState::Ready;
                    }
                }
                let _ = events.send(SessionEvent::TurnResult {
                    text: result.unwrap_or_default(),
                    is_error,
                });
            }
        }
    }
}

fn decompose_exit(status: std::io::Result<ExitStatus>) -> (Option<i32>, Option<i32>) {
    match status {
        Ok(status) => {
            let code = status.code();
            #[cfg(unix)]
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            };
            #[cfg(not(unix))]
            let signal = None;
            (code, signal)
        }
        Err(_) => (None, None),
    }
}

/// Format an exit code/signal pair as a human-readable string.
pub fn format_exit_status(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("exited with code {code}"),
        (None, Some(sig)) => {
            let sig_name = match sig {
                9 => "SIGKILL",
                15 => "SIGTERM",
                11 => "SIGSEGV",
                6 => "SIGABRT",
                _ => "",
            };
            if sig_name.is_empty() {
                format!("killed by signal {sig}")
            } else {
                format!("killed by {sig_name} (signal {sig})")
            }
        }
        (None, None) => "exited (unknown status)".to_string(),
    }
}
