//! Worker Pool Manager.
//!
//! Tasks queue in submission order behind a semaphore sized to
//! `max_concurrent`; each admitted task runs in its own tokio task
//! (see [`worker`]), so one worker's crash, timeout or panic never reaches
//! another. The registry of task states sits behind one mutex and every
//! task's final [`TaskResult`] is published through a watch channel.

pub mod worker;

use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::decision::DecisionPipeline;
use crate::error::PoolError;
use crate::matcher::PatternMatcher;
use crate::resilience::RetryPolicy;
use crate::session::{SessionConfig, WorkerState};

/// Unit of work handed to one agent subprocess. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    /// Workspace for this task; defaults to `<workspace_root>/<id>`.
    pub workspace_ref: Option<PathBuf>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            workspace_ref: None,
        }
    }

    #[must_use]
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace_ref = Some(workspace.into());
        self
    }
}

/// Per-task overrides of pool settings.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub workspace: Option<PathBuf>,
    pub idle_timeout: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub approved_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TaskHandle {
    task_id: String,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.task_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Terminal report for one task; every submitted task gets exactly one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration: Duration,
    pub outcome: TaskOutcome,
    pub attempts: u32,
}

impl TaskResult {
    pub(crate) fn unfinished(task_id: &str, outcome: TaskOutcome, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration: Duration::ZERO,
            outcome,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub output_lines: u64,
    pub confirmations: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Active(WorkerState),
    Finished(TaskOutcome),
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Active(state) => write!(f, "{state}"),
            Self::Finished(outcome) => write!(f, "{outcome}"),
        }
    }
}

impl Serialize for TaskState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub progress: Progress,
}

/// Pool-wide knobs.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_concurrent: usize,
    pub idle_timeout: Duration,
    pub max_duration: Option<Duration>,
    /// Lines of output kept per task (the most recent ones).
    pub output_limit_lines: usize,
    pub workspace_root: PathBuf,
    pub approved_by: Option<String>,
    pub retry: RetryPolicy,
    /// Retry a crashed attempt that never received a verdict.
    pub retry_transient_crashes: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            idle_timeout: Duration::from_secs(300),
            max_duration: None,
            output_limit_lines: 2000,
            workspace_root: std::env::temp_dir().join("fleetpilot"),
            approved_by: None,
            retry: RetryPolicy::default(),
            retry_transient_crashes: false,
        }
    }
}

struct Entry {
    state: TaskState,
    progress: Progress,
    cancel: CancellationToken,
    result: watch::Sender<Option<TaskResult>>,
}

struct Job {
    task: Task,
    options: TaskOptions,
    cancel: CancellationToken,
}

pub(crate) struct Shared {
    settings: PoolSettings,
    session: SessionConfig,
    matcher: Arc<PatternMatcher>,
    pipeline: Arc<DecisionPipeline>,
    registry: Mutex<HashMap<String, Entry>>,
    shutdown: CancellationToken,
}

impl Shared {
    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, task_id: &str, state: TaskState) {
        if let Some(entry) = self.registry().get_mut(task_id)
            && !entry.state.is_finished()
        {
            entry.state = state;
        }
    }

    fn update_progress(&self, task_id: &str, update: impl FnOnce(&mut Progress)) {
        if let Some(entry) = self.registry().get_mut(task_id) {
            update(&mut entry.progress);
        }
    }

    /// Publish the final result; later completions for the same task are ignored.
    fn complete(&self, result: TaskResult) {
        let mut registry = self.registry();
        let Some(entry) = registry.get_mut(&result.task_id) else {
            return;
        };
        if entry.state.is_finished() {
            return;
        }
        entry.state = TaskState::Finished(result.outcome);
        tracing::info!(
            task_id = result.task_id.as_str(),
            outcome = %result.outcome,
            attempts = result.attempts,
            duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            "task finished"
        );
        entry.result.send_replace(Some(result));
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Job>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Build the pool and start its dispatcher. Must be called inside a tokio runtime.
    pub fn new(
        settings: PoolSettings,
        session: SessionConfig,
        matcher: Arc<PatternMatcher>,
        pipeline: Arc<DecisionPipeline>,
    ) -> Self {
        let shared = Arc::new(Shared {
            settings,
            session,
            matcher,
            pipeline,
            registry: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), rx));
        Self {
            shared,
            queue: tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn pipeline(&self) -> &Arc<DecisionPipeline> {
        &self.shared.pipeline
    }

    pub fn submit(&self, task: Task) -> Result<TaskHandle, PoolError> {
        self.submit_with(task, TaskOptions::default())
    }

    pub fn submit_with(&self, task: Task, options: TaskOptions) -> Result<TaskHandle, PoolError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(PoolError::ShutDown);
        }
        let cancel = self.shared.shutdown.child_token();
        let handle = TaskHandle {
            task_id: task.id.clone(),
        };
        self.shared.registry().insert(
            task.id.clone(),
            Entry {
                state: TaskState::Queued,
                progress: Progress::default(),
                cancel: cancel.clone(),
                result: watch::Sender::new(None),
            },
        );
        tracing::debug!(task_id = task.id.as_str(), "task queued");
        if self.queue.send(Job { task, options, cancel }).is_err() {
            self.shared.registry().remove(handle.id());
            return Err(PoolError::ShutDown);
        }
        Ok(handle)
    }

    pub fn status(&self, handle: &TaskHandle) -> Result<TaskStatus, PoolError> {
        self.shared
            .registry()
            .get(handle.id())
            .map(|entry| TaskStatus {
                state: entry.state,
                progress: entry.progress,
            })
            .ok_or_else(|| PoolError::UnknownTask(handle.id().to_string()))
    }

    /// Request cancellation. Returns `false` for unknown or finished tasks.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        let queued = {
            let registry = self.shared.registry();
            let Some(entry) = registry.get(handle.id()) else {
                return false;
            };
            if entry.state.is_finished() {
                return false;
            }
            entry.cancel.cancel();
            entry.state == TaskState::Queued
        };
        tracing::info!(task_id = handle.id(), queued, "task cancellation requested");
        if queued {
            self.shared.complete(TaskResult::unfinished(
                handle.id(),
                TaskOutcome::Cancelled,
                "cancelled before start",
            ));
        }
        true
    }

    /// Wait for every handle's result, in handle order.
    pub async fn await_all(&self, handles: &[TaskHandle]) -> Result<Vec<TaskResult>, PoolError> {
        let mut receivers = Vec::with_capacity(handles.len());
        {
            let registry = self.shared.registry();
            for handle in handles {
                let entry = registry
                    .get(handle.id())
                    .ok_or_else(|| PoolError::UnknownTask(handle.id().to_string()))?;
                receivers.push((handle.id().to_string(), entry.result.subscribe()));
            }
        }

        let mut results = Vec::with_capacity(receivers.len());
        for (task_id, mut rx) in receivers {
            let result = match rx.wait_for(Option::is_some).await {
                Ok(slot) => slot.clone(),
                Err(_) => None,
            };
            results.push(result.unwrap_or_else(|| {
                TaskResult::unfinished(&task_id, TaskOutcome::Failed, "task result was lost")
            }));
        }
        Ok(results)
    }

    /// Drop a finished task from the registry, returning its result.
    pub fn reap(&self, handle: &TaskHandle) -> Option<TaskResult> {
        let mut registry = self.shared.registry();
        if !registry.get(handle.id())?.state.is_finished() {
            return None;
        }
        let entry = registry.remove(handle.id())?;
        entry.result.send_replace(None)
    }

    /// Cancel queued and running tasks and stop accepting new ones.
    pub async fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("worker pool shutting down");
        self.shared.shutdown.cancel();

        let queued: Vec<String> = self
            .shared
            .registry()
            .iter()
            .filter(|(_, entry)| entry.state == TaskState::Queued)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in queued {
            self.shared.complete(TaskResult::unfinished(
                &task_id,
                TaskOutcome::Cancelled,
                "pool shut down before start",
            ));
        }

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
    }
}

async fn dispatch(shared: Arc<Shared>, mut queue: mpsc::UnboundedReceiver<Job>) {
    let permits = Arc::new(Semaphore::new(shared.settings.max_concurrent.max(1)));
    loop {
        let job = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            job = queue.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        if job.cancel.is_cancelled() {
            continue;
        }

        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _permit = permit;
            let task_id = job.task.id.clone();
            let isolated = tokio::spawn(worker::run(Arc::clone(&shared), job.task, job.options, job.cancel));
            if let Err(e) = isolated.await {
                tracing::error!(task_id = task_id.as_str(), "worker aborted: {e}");
                shared.complete(TaskResult::unfinished(
                    &task_id,
                    TaskOutcome::Failed,
                    format!("worker aborted: {e}"),
                ));
            }
        });
    }
    tracing::debug!("dispatcher stopped");
}
