use std::sync::Arc;

use fleetpilot::audit::{AuditRecorder, Metrics, read_log};
use fleetpilot::decision::{DecidedBy, DecisionScope, UnavailableJudge};
use tempfile::TempDir;

use crate::fleet::{pipeline_with, request};

#[tokio::test]
async fn every_decision_lands_in_the_jsonl_log() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("audit").join("decisions.jsonl");
    let recorder = AuditRecorder::open(&log, 50).unwrap();
    let pipeline = Arc::new(pipeline_with(Arc::new(UnavailableJudge), recorder));

    let prompts = [
        "Write to file notes.txt? (y/n)",
        "Delete file /etc/passwd? (y/n)",
        "Fetch https://example.com/data.json? (y/n)",
        "Run command `make lint`? (y/n)",
    ];
    let mut tasks = Vec::new();
    for (i, prompt) in prompts.iter().enumerate() {
        let pipeline = Arc::clone(&pipeline);
        let workspace = tmp.path().to_path_buf();
        let req = request(&format!("w{i}"), prompt);
        tasks.push(tokio::spawn(async move {
            pipeline
                .decide(
                    &req,
                    DecisionScope {
                        workspace: &workspace,
                        approved_by: None,
                    },
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let events = read_log(&log).unwrap();
    assert_eq!(events.len(), prompts.len());

    let live = pipeline.recorder().get_current_metrics();
    let replayed = Metrics::from_events(&events);
    assert_eq!(live.total_decisions, 4);
    assert_eq!(replayed.total_decisions, live.total_decisions);
    assert_eq!(replayed.decisions_by_source, live.decisions_by_source);
    assert_eq!(replayed.template_fallbacks, 2);
    assert_eq!(live.decisions_by_source.get(&DecidedBy::Policy), Some(&1));
    assert_eq!(live.policy_evaluations, 4);

    let recent = pipeline.recorder().get_recent_decisions(2);
    assert_eq!(recent.len(), 2);
}
