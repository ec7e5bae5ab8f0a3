use std::time::Duration;

use fleetpilot::decision::{DecidedBy, Verdict};
use fleetpilot::pool::{Task, TaskOptions, TaskOutcome};
use tempfile::TempDir;

use crate::fleet::{pool, settings, sh};

#[tokio::test]
async fn approved_confirmation_is_answered_and_task_completes() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(
        sh(r#"read task
echo "Write to file notes.txt? (y/n)"
read answer
echo "answer=$answer"
echo "task complete""#),
        settings(tmp.path(), 1),
    );
    let handle = pool.submit(Task::new("write notes")).unwrap();
    let result = pool.await_all(std::slice::from_ref(&handle)).await.unwrap().remove(0);

    assert!(result.success, "{result:?}");
    assert!(result.output.contains("answer=y"), "{}", result.output);
    assert_eq!(pool.status(&handle).unwrap().progress.confirmations, 1);

    let decisions = pool.pipeline().recorder().get_recent_decisions(10);
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].verdict, Verdict::Approve);
    assert_eq!(decisions[0].decided_by, DecidedBy::Rules);
}

#[tokio::test]
async fn denied_confirmation_reaches_the_agent() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(
        sh(r#"read task
echo "Delete file /etc/passwd? (y/n)"
read answer
if [ "$answer" = y ]; then exit 0; fi
echo "error: permission denied by supervisor"
exit 2"#),
        settings(tmp.path(), 1),
    );
    let handle = pool.submit(Task::new("clean up")).unwrap();
    let result = pool.await_all(std::slice::from_ref(&handle)).await.unwrap().remove(0);

    assert_eq!(result.outcome, TaskOutcome::Failed);
    let error = result.error.unwrap();
    assert!(error.contains("exit status: 2"), "{error}");
    assert!(error.contains("permission denied by supervisor"), "{error}");

    let metrics = pool.pipeline().recorder().get_current_metrics();
    assert_eq!(metrics.denials, 1);
    assert_eq!(metrics.policy_denials, 1);
}

#[tokio::test]
async fn undeliverable_verdict_fails_the_task() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(
        sh(r#"read task; exec 0<&-; echo "Write to file notes.txt? (y/n)"; sleep 5"#),
        settings(tmp.path(), 1),
    );
    let handle = pool.submit(Task::new("closed input")).unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(4),
        pool.await_all(std::slice::from_ref(&handle)),
    )
    .await
    .expect("task must fail instead of waiting on its prompt")
    .unwrap()
    .remove(0);

    assert_eq!(result.outcome, TaskOutcome::Failed);
    let error = result.error.unwrap();
    assert!(error.contains("verdict could not be delivered"), "{error}");
    assert!(error.contains("input stream is closed"), "{error}");
    assert_eq!(pool.status(&handle).unwrap().progress.confirmations, 1);
}

#[tokio::test]
async fn unterminated_prompt_is_answered_after_settling() {
    let tmp = TempDir::new().unwrap();
    let mut session =
        sh(r#"read task; printf 'Run command `git status`? (y/n) '; read answer; echo "got $answer""#);
    session.prompt_settle = Duration::from_millis(50);
    let pool = pool(session, settings(tmp.path(), 1));
    let handle = pool.submit(Task::new("inspect")).unwrap();
    let result = pool.await_all(&[handle]).await.unwrap().remove(0);

    assert!(result.success, "{result:?}");
    assert!(result.output.contains("got y"), "{}", result.output);
}

#[tokio::test]
async fn several_confirmations_are_resolved_in_order() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(
        sh(r#"read task
for f in a.txt b.txt c.txt; do
  echo "Write to file $f? (y/n)"
  read answer
  echo "$f=$answer"
done"#),
        settings(tmp.path(), 1),
    );
    let handle = pool.submit(Task::new("three files")).unwrap();
    let result = pool.await_all(std::slice::from_ref(&handle)).await.unwrap().remove(0);

    assert!(result.success);
    let answers: Vec<_> = result
        .output
        .lines()
        .filter(|line| line.contains('='))
        .collect();
    assert_eq!(answers, ["a.txt=y", "b.txt=y", "c.txt=y"]);
    assert_eq!(pool.status(&handle).unwrap().progress.confirmations, 3);
}

#[tokio::test]
async fn task_workspace_is_created_under_the_root() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(sh("read task; pwd"), settings(tmp.path(), 2));

    let default_ws = Task::new("default");
    let default_id = default_ws.id.clone();
    let custom = Task::new("custom").with_workspace("shared/custom");
    let handles = vec![pool.submit(default_ws).unwrap(), pool.submit(custom).unwrap()];
    let results = pool.await_all(&handles).await.unwrap();

    assert!(results[0].output.trim().ends_with(&default_id));
    assert!(results[1].output.trim().ends_with("shared/custom"));
    assert!(tmp.path().join("shared/custom").is_dir());
}

#[tokio::test]
async fn max_duration_bounds_a_chatty_worker() {
    let tmp = TempDir::new().unwrap();
    let pool = pool(
        sh("read task; while true; do echo working; sleep 0.05; done"),
        settings(tmp.path(), 1),
    );
    let handle = pool
        .submit_with(
            Task::new("never ends"),
            TaskOptions {
                max_duration: Some(Duration::from_millis(400)),
                ..TaskOptions::default()
            },
        )
        .unwrap();
    let result = pool.await_all(&[handle]).await.unwrap().remove(0);

    assert_eq!(result.outcome, TaskOutcome::TimedOut);
    assert!(result.error.unwrap().contains("maximum duration"));
    assert!(result.duration < Duration::from_secs(3));
}
