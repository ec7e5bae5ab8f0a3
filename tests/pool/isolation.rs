use std::time::{Duration, Instant};

use fleetpilot::pool::{Task, TaskOptions, TaskOutcome, WorkerPool};
use fleetpilot::session::SessionConfig;
use tempfile::TempDir;

use crate::fleet::{pool, process_gone, settings, sh};

/// Agent whose behaviour is chosen by the task description.
const MULTI_AGENT: &str = r#"read task
case "$task" in
  silent) echo $$ > agent.pid; exec sleep 30 ;;
  crash) echo "error: segfault in tool"; exit 3 ;;
  *) echo "working on $task"; sleep 0.2; echo "task complete" ;;
esac"#;

#[tokio::test]
async fn silent_worker_times_out_while_others_complete() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(sh(MULTI_AGENT), settings(tmp.path(), 3));
    let started = Instant::now();
    let silent_task = Task::new("silent");
    let pid_file = tmp.path().join(&silent_task.id).join("agent.pid");

    let silent = pool
        .submit_with(
            silent_task,
            TaskOptions {
                idle_timeout: Some(Duration::from_millis(400)),
                ..TaskOptions::default()
            },
        )
        .unwrap();
    let first = pool.submit(Task::new("first")).unwrap();
    let second = pool.submit(Task::new("second")).unwrap();

    let results = pool.await_all(&[silent, first, second]).await.unwrap();

    assert_eq!(results[0].outcome, TaskOutcome::TimedOut);
    assert!(!results[0].success);
    assert!(results[0].error.as_deref().unwrap().contains("no qualifying output"));
    assert!(results[1].success && results[2].success, "{results:?}");
    assert!(started.elapsed() < Duration::from_secs(10));

    let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    assert!(process_gone(pid), "timed-out agent {pid} is still running");
}

#[tokio::test]
async fn crash_is_contained_to_its_task() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(sh(MULTI_AGENT), settings(tmp.path(), 2));

    let handles = vec![
        pool.submit(Task::new("crash")).unwrap(),
        pool.submit(Task::new("steady")).unwrap(),
    ];
    let results = pool.await_all(&handles).await.unwrap();

    assert_eq!(results[0].outcome, TaskOutcome::Failed);
    assert_eq!(results[0].attempts, 1);
    let error = results[0].error.as_deref().unwrap();
    assert!(error.contains("exit status: 3"), "{error}");
    assert!(error.contains("segfault"), "{error}");
    assert!(results[1].success);
    assert!(results[1].output.contains("working on steady"));
}

#[tokio::test]
async fn crash_before_any_verdict_is_retried_when_enabled() {
    let tmp = TempDir::new().unwrap();
    let mut settings = settings(tmp.path(), 1);
    settings.retry_transient_crashes = true;
    let pool = pool(
        sh("read task; if [ -f .attempted ]; then echo recovered; else touch .attempted; exit 1; fi"),
        settings,
    );

    let handle = pool.submit(Task::new("flaky")).unwrap();
    let result = pool.await_all(&[handle]).await.unwrap().remove(0);

    assert!(result.success, "{result:?}");
    assert_eq!(result.attempts, 2);
    assert!(result.output.contains("recovered"));
}

#[tokio::test]
async fn missing_executable_fails_without_retry() {
    let tmp = TempDir::new().unwrap();
    let pool = WorkerPool::new(
        settings(tmp.path(), 1),
        SessionConfig::new("/nonexistent/fleetpilot-agent"),
        std::sync::Arc::default(),
        crate::fleet::offline_pipeline(),
    );

    let handle = pool.submit(Task::new("anything")).unwrap();
    let result = pool.await_all(&[handle]).await.unwrap().remove(0);

    assert_eq!(result.outcome, TaskOutcome::Failed);
    assert_eq!(result.attempts, 1);
    assert!(result.error.unwrap().contains("executable not found"));
}
