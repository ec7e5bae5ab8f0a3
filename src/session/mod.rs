//! Pseudo-Session: owns one worker subprocess and its piped terminal.
//!
//! A background pump reads stdout and stderr, feeds both through the
//! [`PatternMatcher`], numbers every event and queues it. The owning worker
//! drains that queue through [`PseudoSession::read_until`], its single
//! suspension point, and answers confirmations with [`PseudoSession::reply`].

pub mod state;

pub use state::WorkerState;

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::decision::Verdict;
use crate::error::{SessionError, SpawnError};
use crate::matcher::{ConfirmationRequest, OutputEvent, PatternMatcher};

const READ_CHUNK: usize = 4096;
const EVENT_QUEUE: usize = 256;

/// How to launch and drive an agent subprocess.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Pass the task description as the last argument instead of on stdin.
    pub task_as_arg: bool,
    /// Upper bound for a single `write`.
    pub flush_timeout: Duration,
    /// Wait between SIGTERM and SIGKILL of the worker's process group.
    pub terminate_grace: Duration,
    /// Quiet period after which an unterminated prompt is promoted.
    /// Zero keeps partial lines buffered until their newline arrives.
    pub prompt_settle: Duration,
}

impl SessionConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            task_as_arg: false,
            flush_timeout: Duration::from_secs(2),
            terminate_grace: Duration::from_secs(3),
            prompt_settle: Duration::ZERO,
        }
    }
}

/// Result of a [`PseudoSession::read_until`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A matching event, a confirmation request, or end of stream.
    Event(OutputEvent),
    /// Nothing qualifying arrived in time; the worker has been terminated.
    TimedOut,
    /// The session's cancellation token fired.
    Cancelled,
    /// The stream had already ended before this call.
    Closed,
}

pub struct PseudoSession {
    worker_id: String,
    child: Child,
    /// The agent leads its own process group, so its descendants share this id.
    pgid: Option<Pid>,
    stdin: Option<ChildStdin>,
    events: mpsc::Receiver<OutputEvent>,
    pump: Option<JoinHandle<()>>,
    state: WorkerState,
    pending: Option<ConfirmationRequest>,
    cancel: CancellationToken,
    exit: Option<ExitStatus>,
    stream_done: bool,
    terminated: bool,
    flush_timeout: Duration,
    terminate_grace: Duration,
}

impl PseudoSession {
    /// Start the agent in `workspace` (created if missing) and hand it the task.
    pub async fn spawn(
        worker_id: &str,
        description: &str,
        workspace: &Path,
        config: &SessionConfig,
        matcher: Arc<PatternMatcher>,
        cancel: CancellationToken,
    ) -> Result<Self, SpawnError> {
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|source| SpawnError::Workspace {
                path: workspace.to_path_buf(),
                source,
            })?;

        let mut command = Command::new(&config.program);
        command.args(&config.args);
        if config.task_as_arg {
            command.arg(description);
        }
        command
            .envs(&config.env)
            .env("FLEETPILOT_WORKER_ID", worker_id)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                SpawnError::ExecutableNotFound {
                    program: config.program.clone(),
                }
            } else {
                SpawnError::Io(e)
            }
        })?;

        let stdin = child.stdin.take().ok_or(SpawnError::Stdio("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::Stdio("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::Stdio("stderr"))?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let pump = tokio::spawn(pump_output(
            worker_id.to_string(),
            matcher,
            stdout,
            stderr,
            tx,
            config.prompt_settle,
        ));

        let pgid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw);
        let mut session = Self {
            worker_id: worker_id.to_string(),
            child,
            pgid,
            stdin: Some(stdin),
            events: rx,
            pump: Some(pump),
            state: WorkerState::Spawning,
            pending: None,
            cancel,
            exit: None,
            stream_done: false,
            terminated: false,
            flush_timeout: config.flush_timeout,
            terminate_grace: config.terminate_grace,
        };

        if !config.task_as_arg {
            match session.write(description).await {
                Ok(()) | Err(SessionError::StdinClosed) => {}
                Err(SessionError::Io(e)) => return Err(SpawnError::Io(e)),
                Err(e) => return Err(SpawnError::Io(std::io::Error::other(e.to_string()))),
            }
        }

        session.transition(WorkerState::Running);
        tracing::info!(
            worker_id,
            pid = session.child.id(),
            program = config.program.as_str(),
            "worker spawned"
        );
        Ok(session)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn pending_confirmation(&self) -> Option<&ConfirmationRequest> {
        self.pending.as_ref()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state.can_transition_to(next) {
            tracing::debug!(worker_id = self.worker_id.as_str(), from = %self.state, to = %next, "worker state");
            self.state = next;
        }
    }

    /// Wait for the next event satisfying `predicate`.
    ///
    /// Confirmation requests and end of stream always end the read, whether
    /// or not they satisfy `predicate`; events that do not qualify are
    /// consumed. While a confirmation is unanswered this returns
    /// [`SessionError::VerdictPending`].
    pub async fn read_until<P>(
        &mut self,
        mut predicate: P,
        timeout: Duration,
    ) -> Result<ReadOutcome, SessionError>
    where
        P: FnMut(&OutputEvent) -> bool,
    {
        if self.state == WorkerState::WaitingConfirmation {
            return Err(SessionError::VerdictPending);
        }
        if self.stream_done {
            return Ok(ReadOutcome::Closed);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(ReadOutcome::Cancelled),
                next = tokio::time::timeout_at(deadline, self.events.recv()) => next,
            };

            let Ok(next) = next else {
                tracing::warn!(
                    worker_id = self.worker_id.as_str(),
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "no qualifying output, terminating worker"
                );
                self.transition(WorkerState::TimedOut);
                self.terminate().await;
                return Ok(ReadOutcome::TimedOut);
            };

            let Some(event) = next else {
                self.finish_stream().await;
                return Ok(ReadOutcome::Closed);
            };

            if let Some(request) = event.confirmation() {
                tracing::info!(
                    worker_id = self.worker_id.as_str(),
                    category = %request.category,
                    risk = %request.risk_level,
                    "confirmation requested"
                );
                self.pending = Some(request.clone());
                self.transition(WorkerState::WaitingConfirmation);
                return Ok(ReadOutcome::Event(event));
            }
            if event.is_eof() {
                self.finish_stream().await;
                return Ok(ReadOutcome::Event(event));
            }
            if predicate(&event) {
                return Ok(ReadOutcome::Event(event));
            }
        }
    }

    /// Inject `text` (newline-terminated) into the agent's input.
    pub async fn write(&mut self, text: &str) -> Result<(), SessionError> {
        let limit = self.flush_timeout;
        let stdin = self.stdin.as_mut().ok_or(SessionError::StdinClosed)?;

        let mut payload = text.as_bytes().to_vec();
        if !text.ends_with('\n') {
            payload.push(b'\n');
        }
        let flush = async {
            stdin.write_all(&payload).await?;
            stdin.flush().await
        };
        let result = tokio::time::timeout(limit, flush).await;

        match result {
            Err(_) => Err(SessionError::WriteTimeout(limit)),
            Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {
                self.stdin = None;
                Err(SessionError::StdinClosed)
            }
            Ok(Err(e)) => Err(SessionError::Io(e)),
            Ok(Ok(())) => {
                if self.state == WorkerState::WaitingConfirmation {
                    self.pending = None;
                    self.transition(WorkerState::Running);
                }
                Ok(())
            }
        }
    }

    /// Answer the pending confirmation with its approve or deny reply.
    pub async fn reply(&mut self, verdict: Verdict) -> Result<(), SessionError> {
        let Some(pending) = self.pending.as_ref() else {
            return Err(SessionError::NoPendingConfirmation);
        };
        let text = match verdict {
            Verdict::Approve => pending.replies.approve.clone(),
            Verdict::Deny => pending.replies.deny.clone(),
        };
        self.write(&text).await
    }

    /// Close input and SIGTERM the process group; SIGKILL whatever is left
    /// after the grace period. Idempotent.
    pub async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.cancel.cancel();
        self.stdin = None;

        if self.exit.is_none() {
            self.exit = self.stop_process_group().await;
            // Descendants may outlive the agent itself.
            self.signal_group(Signal::SIGKILL);
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.stream_done = true;
        self.transition(WorkerState::Failed);
        tracing::info!(worker_id = self.worker_id.as_str(), state = %self.state, "worker terminated");
    }

    async fn stop_process_group(&mut self) -> Option<ExitStatus> {
        self.signal_group(Signal::SIGTERM);
        match tokio::time::timeout(self.terminate_grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                tracing::debug!(
                    worker_id = self.worker_id.as_str(),
                    "grace period elapsed, killing process group"
                );
                self.signal_group(Signal::SIGKILL);
                if let Err(e) = self.child.start_kill() {
                    tracing::debug!(worker_id = self.worker_id.as_str(), "kill failed: {e}");
                }
                self.child.wait().await.ok()
            }
        }
    }

    /// Deliver `signal` to every process in the worker's group.
    fn signal_group(&self, signal: Signal) {
        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(
                worker_id = self.worker_id.as_str(),
                pgid = pgid.as_raw(),
                signal = ?signal,
                "failed to signal process group: {e}"
            ),
        }
    }

    /// Block until the process exits.
    pub async fn wait_exit(&mut self) -> Result<ExitStatus, SessionError> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }

    async fn finish_stream(&mut self) {
        self.stream_done = true;
        self.stdin = None;
        let status = match tokio::time::timeout(self.terminate_grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(worker_id = self.worker_id.as_str(), "wait failed: {e}");
                None
            }
            Err(_) => {
                tracing::warn!(
                    worker_id = self.worker_id.as_str(),
                    "output closed but process still running, killing"
                );
                self.signal_group(Signal::SIGKILL);
                let _ = self.child.start_kill();
                self.child.wait().await.ok()
            }
        };
        self.exit = status;
        let next = match status {
            Some(status) if status.success() => WorkerState::Completed,
            _ => WorkerState::Crashed,
        };
        self.transition(next);
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for PseudoSession {
    fn drop(&mut self) {
        // `kill_on_drop` only reaches the agent, not its descendants.
        if !self.terminated && self.exit.is_none() {
            self.signal_group(Signal::SIGKILL);
        }
    }
}

enum Input {
    Stdout(std::io::Result<usize>),
    Stderr(std::io::Result<usize>),
    Quiet,
}

async fn pump_output<O, E>(
    worker_id: String,
    matcher: Arc<PatternMatcher>,
    mut stdout: O,
    mut stderr: E,
    tx: mpsc::Sender<OutputEvent>,
    settle: Duration,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_chunk = [0u8; READ_CHUNK];
    let mut err_chunk = [0u8; READ_CHUNK];
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let (mut out_open, mut err_open) = (true, true);
    let settles = !settle.is_zero();
    let mut settle_due = false;
    let mut seq = 0u64;

    while out_open || err_open {
        let input = tokio::select! {
            read = stdout.read(&mut out_chunk), if out_open => Input::Stdout(read),
            read = stderr.read(&mut err_chunk), if err_open => Input::Stderr(read),
            () = tokio::time::sleep(settle), if settle_due => Input::Quiet,
        };

        let events = match input {
            Input::Stdout(read) => {
                let events = feed(&matcher, &worker_id, &out_chunk, read, &mut out_buf, &mut out_open);
                settle_due = settles && (!out_buf.is_empty() || !err_buf.is_empty());
                events
            }
            Input::Stderr(read) => {
                let events = feed(&matcher, &worker_id, &err_chunk, read, &mut err_buf, &mut err_open);
                settle_due = settles && (!out_buf.is_empty() || !err_buf.is_empty());
                events
            }
            Input::Quiet => {
                settle_due = false;
                let mut events = promote(&matcher, &worker_id, &mut out_buf);
                events.extend(promote(&matcher, &worker_id, &mut err_buf));
                events
            }
        };

        for mut event in events {
            seq += 1;
            event.seq = seq;
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }

    for mut event in matcher.finish(&worker_id, Vec::new()) {
        seq += 1;
        event.seq = seq;
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

fn feed(
    matcher: &PatternMatcher,
    worker_id: &str,
    chunk: &[u8],
    read: std::io::Result<usize>,
    buffer: &mut Vec<u8>,
    open: &mut bool,
) -> Vec<OutputEvent> {
    let pending = std::mem::take(buffer);
    match read {
        Ok(n) if n > 0 => {
            let classified = matcher.classify(worker_id, &chunk[..n], pending);
            *buffer = classified.remaining;
            classified.events
        }
        other => {
            if let Err(e) = other {
                tracing::debug!(worker_id, "output stream read failed: {e}");
            }
            *open = false;
            if pending.is_empty() {
                Vec::new()
            } else {
                matcher.classify(worker_id, b"\n", pending).events
            }
        }
    }
}

fn promote(matcher: &PatternMatcher, worker_id: &str, buffer: &mut Vec<u8>) -> Vec<OutputEvent> {
    let settled = matcher.settle(worker_id, std::mem::take(buffer));
    *buffer = settled.remaining;
    settled.events
}
