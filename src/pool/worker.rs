//! Supervision loop for one task: spawn, drain output, route confirmations
//! through the decision pipeline, and fold the ending into a `TaskResult`.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::{Shared, Task, TaskOptions, TaskOutcome, TaskResult, TaskState};
use crate::decision::DecisionScope;
use crate::error::{SessionError, SpawnError};
use crate::matcher::EventKind;
use crate::session::{PseudoSession, ReadOutcome, WorkerState};

/// What one attempt produced.
#[derive(Debug)]
struct Attempt {
    outcome: TaskOutcome,
    error: Option<String>,
    verdicts: u32,
}

#[derive(Debug)]
enum AttemptFailure {
    Spawn(SpawnError),
    /// Abnormal exit; retryable only when no verdict was delivered.
    Crash(Attempt),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "spawn failed: {e}"),
            Self::Crash(attempt) => {
                write!(f, "{}", attempt.error.as_deref().unwrap_or("agent crashed"))
            }
        }
    }
}

struct Run<'a> {
    shared: &'a Shared,
    task: &'a Task,
    workspace: PathBuf,
    approved_by: Option<String>,
    idle_timeout: Duration,
    deadline: Option<Instant>,
    cancel: &'a CancellationToken,
    output: std::sync::Mutex<VecDeque<String>>,
}

pub(super) async fn run(
    shared: Arc<Shared>,
    task: Task,
    options: TaskOptions,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let settings = &shared.settings;
    let workspace = match options.workspace.or_else(|| task.workspace_ref.clone()) {
        Some(workspace) => resolve_workspace(&settings.workspace_root, &workspace),
        None => settings.workspace_root.join(&task.id),
    };
    let max_duration = options.max_duration.or(settings.max_duration);

    let supervisor = Run {
        shared: &shared,
        task: &task,
        workspace,
        approved_by: options.approved_by.or_else(|| settings.approved_by.clone()),
        idle_timeout: options.idle_timeout.unwrap_or(settings.idle_timeout),
        deadline: max_duration.map(|d| started + d),
        cancel: &cancel,
        output: std::sync::Mutex::new(VecDeque::new()),
    };

    let retry_crashes = settings.retry_transient_crashes;
    let result = settings
        .retry
        .run(
            "worker",
            |attempt| supervisor.attempt(attempt),
            |failure: &AttemptFailure| {
                !cancel.is_cancelled()
                    && match failure {
                        AttemptFailure::Spawn(e) => e.is_transient(),
                        AttemptFailure::Crash(attempt) => retry_crashes && attempt.verdicts == 0,
                    }
            },
        )
        .await;

    let attempts = shared
        .registry()
        .get(&task.id)
        .map_or(1, |entry| entry.progress.attempts.max(1));
    let (outcome, error) = match result {
        Ok(attempt) => (attempt.outcome, attempt.error),
        Err(AttemptFailure::Crash(attempt)) => (attempt.outcome, attempt.error),
        Err(failure @ AttemptFailure::Spawn(_)) => (TaskOutcome::Failed, Some(failure.to_string())),
    };

    let output = supervisor
        .output
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    shared.complete(TaskResult {
        task_id: task.id.clone(),
        success: outcome == TaskOutcome::Succeeded,
        output: Vec::from(output).join("\n"),
        error,
        duration: started.elapsed(),
        outcome,
        attempts,
    });
}

impl Run<'_> {
    fn push_output(&self, line: String) {
        let mut output = self
            .output
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if output.len() >= self.shared.settings.output_limit_lines.max(1) {
            output.pop_front();
        }
        output.push_back(line);
    }

    fn next_wait(&self) -> Duration {
        match self.deadline {
            Some(deadline) => self
                .idle_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.idle_timeout,
        }
    }

    fn timeout_reason(&self) -> String {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            "task exceeded its maximum duration".to_string()
        } else {
            SessionError::Timeout(self.idle_timeout).to_string()
        }
    }

    async fn attempt(&self, attempt: u32) -> Result<Attempt, AttemptFailure> {
        let task_id = self.task.id.as_str();
        self.shared.set_state(task_id, TaskState::Active(WorkerState::Spawning));
        self.shared.update_progress(task_id, |p| p.attempts = attempt);

        if self.cancel.is_cancelled() {
            return Ok(Attempt {
                outcome: TaskOutcome::Cancelled,
                error: Some("cancelled before start".into()),
                verdicts: 0,
            });
        }

        let worker_id = format!("{}-{attempt}", short_id(task_id));
        let mut session = PseudoSession::spawn(
            &worker_id,
            &self.task.description,
            &self.workspace,
            &self.shared.session,
            Arc::clone(&self.shared.matcher),
            self.cancel.child_token(),
        )
        .await
        .map_err(AttemptFailure::Spawn)?;
        tracing::info!(task_id, worker_id = worker_id.as_str(), attempt, "worker started");

        let mut verdicts = 0u32;
        let mut last_error: Option<String> = None;
        loop {
            self.shared.set_state(task_id, TaskState::Active(session.state()));
            let outcome = match session.read_until(|_| true, self.next_wait()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    session.terminate().await;
                    return Ok(Attempt {
                        outcome: TaskOutcome::Failed,
                        error: Some(e.to_string()),
                        verdicts,
                    });
                }
            };

            match outcome {
                ReadOutcome::Event(event) => {
                    if let Some(request) = event.confirmation() {
                        let request = request.clone();
                        self.push_output(event.raw_text);
                        self.shared
                            .set_state(task_id, TaskState::Active(WorkerState::WaitingConfirmation));
                        let decision = self
                            .shared
                            .pipeline
                            .decide(
                                &request,
                                DecisionScope {
                                    workspace: &self.workspace,
                                    approved_by: self.approved_by.as_deref(),
                                },
                            )
                            .await;
                        verdicts += 1;
                        self.shared.update_progress(task_id, |p| p.confirmations += 1);
                        if let Err(e) = session.reply(decision.verdict).await {
                            tracing::warn!(
                                task_id,
                                worker_id = worker_id.as_str(),
                                verdict = %decision.verdict,
                                "verdict could not be delivered: {e}"
                            );
                            session.terminate().await;
                            return Ok(Attempt {
                                outcome: TaskOutcome::Failed,
                                error: Some(format!("verdict could not be delivered: {e}")),
                                verdicts,
                            });
                        }
                        continue;
                    }
                    if event.is_eof() {
                        return self.finished(&session, verdicts, last_error);
                    }
                    if matches!(event.kind, EventKind::Error) {
                        last_error = Some(event.raw_text.clone());
                    }
                    self.push_output(event.raw_text);
                    self.shared.update_progress(task_id, |p| p.output_lines += 1);
                }
                ReadOutcome::Closed => return self.finished(&session, verdicts, last_error),
                ReadOutcome::TimedOut => {
                    return Ok(Attempt {
                        outcome: TaskOutcome::TimedOut,
                        error: Some(self.timeout_reason()),
                        verdicts,
                    });
                }
                ReadOutcome::Cancelled => {
                    session.terminate().await;
                    return Ok(Attempt {
                        outcome: TaskOutcome::Cancelled,
                        error: Some("cancelled".into()),
                        verdicts,
                    });
                }
            }
        }
    }

    fn finished(
        &self,
        session: &PseudoSession,
        verdicts: u32,
        last_error: Option<String>,
    ) -> Result<Attempt, AttemptFailure> {
        if session.state() == WorkerState::Completed {
            return Ok(Attempt {
                outcome: TaskOutcome::Succeeded,
                error: None,
                verdicts,
            });
        }
        let status = session
            .exit_status()
            .map_or_else(|| "unknown status".to_string(), |s| s.to_string());
        let cause = match last_error {
            Some(line) => format!("{status}; last error: {line}"),
            None => status,
        };
        let error = SessionError::Crash(cause).to_string();
        Err(AttemptFailure::Crash(Attempt {
            outcome: TaskOutcome::Failed,
            error: Some(error),
            verdicts,
        }))
    }
}

fn short_id(task_id: &str) -> &str {
    task_id.get(..8).unwrap_or(task_id)
}

/// Relative workspaces live under the pool root.
fn resolve_workspace(root: &Path, workspace: &Path) -> PathBuf {
    if workspace.is_absolute() {
        workspace.to_path_buf()
    } else {
        root.join(workspace)
    }
}
