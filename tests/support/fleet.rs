#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fleetpilot::audit::AuditRecorder;
use fleetpilot::decision::{DecisionPipeline, Judge, UnavailableJudge};
use fleetpilot::matcher::{ConfirmationRequest, PatternMatcher};
use fleetpilot::policy::{RuleSet, RuleSetHandle};
use fleetpilot::pool::{PoolSettings, WorkerPool};
use fleetpilot::resilience::{BreakerConfig, CircuitBreaker, RetryPolicy};
use fleetpilot::session::SessionConfig;

/// Whether `pid` has exited (an unreaped zombie counts as exited).
pub fn process_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        Err(_) => nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err(),
    }
}

/// Agent stand-in: `/bin/sh -c <script>`.
pub fn sh(script: &str) -> SessionConfig {
    SessionConfig {
        program: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
        env: BTreeMap::new(),
        task_as_arg: false,
        flush_timeout: Duration::from_secs(1),
        terminate_grace: Duration::from_millis(200),
        prompt_settle: Duration::ZERO,
    }
}

/// Classify one prompt line the way a live session would.
pub fn request(worker_id: &str, prompt: &str) -> ConfirmationRequest {
    let line = format!("{prompt}\n");
    let classified = PatternMatcher::default().classify(worker_id, line.as_bytes(), Vec::new());
    classified.events[0]
        .confirmation()
        .cloned()
        .unwrap_or_else(|| panic!("not a confirmation prompt: {prompt}"))
}

pub fn pipeline_with(judge: Arc<dyn Judge>, recorder: AuditRecorder) -> DecisionPipeline {
    DecisionPipeline::new(
        RuleSetHandle::new(RuleSet::builtin()),
        judge,
        Arc::new(CircuitBreaker::new("judge", BreakerConfig::default())),
        Arc::new(recorder),
    )
    .with_judge_timeout(Duration::from_millis(300))
}

pub fn offline_pipeline() -> Arc<DecisionPipeline> {
    Arc::new(pipeline_with(
        Arc::new(UnavailableJudge),
        AuditRecorder::in_memory(100),
    ))
}

pub fn settings(root: &Path, max_concurrent: usize) -> PoolSettings {
    PoolSettings {
        max_concurrent,
        idle_timeout: Duration::from_secs(5),
        max_duration: None,
        output_limit_lines: 100,
        workspace_root: root.to_path_buf(),
        approved_by: None,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        },
        retry_transient_crashes: false,
    }
}

pub fn pool(session: SessionConfig, settings: PoolSettings) -> WorkerPool {
    WorkerPool::new(
        settings,
        session,
        Arc::new(PatternMatcher::default()),
        offline_pipeline(),
    )
}
