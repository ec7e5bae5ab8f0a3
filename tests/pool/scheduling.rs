use std::collections::HashSet;
use std::time::Duration;

use fleetpilot::error::PoolError;
use fleetpilot::pool::{Task, TaskOutcome, TaskState};
use fleetpilot::session::WorkerState;
use tempfile::TempDir;

use crate::fleet::{pool, settings, sh};

#[tokio::test]
async fn concurrency_limit_holds_and_queue_is_fifo() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("runs.log");
    let script = format!(
        r#"read task; echo "start $task" >> {log}; sleep 0.3; echo "end $task" >> {log}; echo done"#,
        log = log.display()
    );
    let pool = pool(sh(&script), settings(&tmp.path().join("ws"), 2));

    let handles: Vec<_> = (1..=5)
        .map(|i| pool.submit(Task::new(format!("t{i}"))).unwrap())
        .collect();
    let results = pool.await_all(&handles).await.unwrap();
    assert!(results.iter().all(|r| r.success), "{results:?}");
    for (handle, result) in handles.iter().zip(&results) {
        assert_eq!(handle.id(), result.task_id);
    }

    let contents = std::fs::read_to_string(&log).unwrap();
    let mut running = 0i32;
    let mut peak = 0i32;
    let mut starts = Vec::new();
    for line in contents.lines() {
        if let Some(task) = line.strip_prefix("start ") {
            running += 1;
            starts.push(task.to_string());
        } else {
            running -= 1;
        }
        peak = peak.max(running);
    }
    assert_eq!(peak, 2, "{contents}");
    let first_two: HashSet<_> = starts[..2].iter().map(String::as_str).collect();
    assert_eq!(first_two, HashSet::from(["t1", "t2"]));
    assert_eq!(starts.last().map(String::as_str), Some("t5"));
}

#[tokio::test]
async fn cancelling_a_queued_task_resolves_it_immediately() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(sh("read task; exec sleep 5"), settings(tmp.path(), 1));

    let running = pool.submit(Task::new("long")).unwrap();
    let queued = pool.submit(Task::new("waiting")).unwrap();
    assert_eq!(pool.status(&queued).unwrap().state, TaskState::Queued);

    assert!(pool.cancel(&queued));
    assert!(pool.cancel(&running));

    let results = tokio::time::timeout(Duration::from_secs(4), pool.await_all(&[running, queued]))
        .await
        .expect("cancelled tasks must resolve promptly")
        .unwrap();
    assert!(results.iter().all(|r| r.outcome == TaskOutcome::Cancelled));
    assert!(results.iter().all(|r| !r.success));
    assert_eq!(results[1].attempts, 0);
}

#[tokio::test]
async fn cancel_reports_false_once_finished() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(sh("read task; echo ok"), settings(tmp.path(), 1));
    let handle = pool.submit(Task::new("quick")).unwrap();
    pool.await_all(std::slice::from_ref(&handle)).await.unwrap();

    assert!(!pool.cancel(&handle));
    let result = pool.reap(&handle).unwrap();
    assert_eq!(result.outcome, TaskOutcome::Succeeded);
    assert!(matches!(pool.status(&handle), Err(PoolError::UnknownTask(_))));
}

#[tokio::test]
async fn status_reports_state_and_progress() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(
        sh("read task; echo one; echo two; echo three; exec sleep 5"),
        settings(tmp.path(), 1),
    );
    let handle = pool.submit(Task::new("progress")).unwrap();

    let mut seen_running = false;
    for _ in 0..100 {
        let status = pool.status(&handle).unwrap();
        if status.state == TaskState::Active(WorkerState::Running) && status.progress.output_lines == 3 {
            seen_running = true;
            assert_eq!(status.progress.attempts, 1);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(seen_running, "worker never reported three lines while running");

    pool.cancel(&handle);
    let result = pool.await_all(std::slice::from_ref(&handle)).await.unwrap();
    assert_eq!(result[0].outcome, TaskOutcome::Cancelled);
    assert_eq!(result[0].output, "one\ntwo\nthree");
    assert_eq!(
        pool.status(&handle).unwrap().state,
        TaskState::Finished(TaskOutcome::Cancelled)
    );
}

#[tokio::test]
async fn shutdown_cancels_work_and_rejects_new_tasks() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(sh("read task; exec sleep 5"), settings(tmp.path(), 1));
    let running = pool.submit(Task::new("a")).unwrap();
    let queued = pool.submit(Task::new("b")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    pool.shutdown().await;

    let results = tokio::time::timeout(Duration::from_secs(4), pool.await_all(&[running, queued]))
        .await
        .unwrap()
        .unwrap();
    assert!(results.iter().all(|r| r.outcome == TaskOutcome::Cancelled), "{results:?}");
    assert!(matches!(pool.submit(Task::new("late")), Err(PoolError::ShutDown)));
}
