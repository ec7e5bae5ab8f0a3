use std::sync::Arc;
use std::time::Duration;

use fleetpilot::audit::AuditRecorder;
use fleetpilot::decision::{DecidedBy, DecisionScope, HttpJudge, Verdict};
use fleetpilot::matcher::{Category, RiskLevel};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::fleet::{offline_pipeline, pipeline_with, request};

fn scope(tmp: &TempDir) -> DecisionScope<'_> {
    DecisionScope {
        workspace: tmp.path(),
        approved_by: None,
    }
}

fn completion(content: &str) -> serde_json::Value {
    serde_json::json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    })
}

async fn judge_server(response: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(response)
        .mount(&server)
        .await;
    server
}

fn http_judge(server: &MockServer) -> Arc<HttpJudge> {
    Arc::new(HttpJudge::new(
        &format!("{}/v1", server.uri()),
        "judge-model",
        None,
        0.0,
    ))
}

#[tokio::test]
async fn workspace_write_is_approved_by_rules_quickly() {
    let tmp = TempDir::new().unwrap();
    let pipeline = offline_pipeline();
    let req = request("w1", "Write to file notes.txt? (y/n)");
    assert_eq!(req.category, Category::FileWrite);
    assert_eq!(req.risk_level, RiskLevel::Low);

    let event = pipeline.decide(&req, scope(&tmp)).await;

    assert_eq!(event.verdict, Verdict::Approve);
    assert_eq!(event.decided_by, DecidedBy::Rules);
    assert!(!event.is_fallback);
    assert!(event.latency_ms < 5.0, "latency {}ms", event.latency_ms);
}

#[tokio::test]
async fn deleting_etc_passwd_is_denied_by_policy() {
    let tmp = TempDir::new().unwrap();
    let pipeline = offline_pipeline();
    let req = request("w1", "Delete file /etc/passwd? (y/n)");
    assert_eq!(req.risk_level, RiskLevel::High);

    let event = pipeline.decide(&req, scope(&tmp)).await;

    assert_eq!(event.verdict, Verdict::Deny);
    assert_eq!(event.decided_by, DecidedBy::Policy);
    assert_eq!(pipeline.recorder().get_current_metrics().policy_denials, 1);
}

#[tokio::test]
async fn unmatched_command_is_approved_by_the_judge() {
    let tmp = TempDir::new().unwrap();
    let server = judge_server(ResponseTemplate::new(200).set_body_json(completion(
        r#"{"verdict":"approve","reasoning":"safe read-only command"}"#,
    )))
    .await;
    let pipeline = pipeline_with(http_judge(&server), AuditRecorder::in_memory(10));
    let req = request("w1", "Run command `make lint`? (y/n)");
    assert_eq!(req.category, Category::BashExec);

    let event = pipeline.decide(&req, scope(&tmp)).await;

    assert_eq!(event.verdict, Verdict::Approve);
    assert_eq!(event.decided_by, DecidedBy::Ai);
    assert_eq!(event.reasoning, "safe read-only command");
    assert!(!event.is_fallback);
}

#[tokio::test]
async fn judge_timeout_falls_back_to_template_deny() {
    let tmp = TempDir::new().unwrap();
    let server = judge_server(
        ResponseTemplate::new(200)
            .set_body_json(completion(r#"{"verdict":"approve","reasoning":"late"}"#))
            .set_delay(Duration::from_secs(3)),
    )
    .await;
    let pipeline = pipeline_with(http_judge(&server), AuditRecorder::in_memory(10));
    let req = request("w1", "Run command `make lint`? (y/n)");

    let event = pipeline.decide(&req, scope(&tmp)).await;

    assert_eq!(event.verdict, Verdict::Deny);
    assert_eq!(event.decided_by, DecidedBy::Template);
    assert!(event.is_fallback);
    assert_eq!(pipeline.breaker().snapshot().failure_count, 1);
}

#[tokio::test]
async fn malformed_judge_reply_falls_back() {
    let tmp = TempDir::new().unwrap();
    let server = judge_server(
        ResponseTemplate::new(200).set_body_json(completion("I would rather not say.")),
    )
    .await;
    let pipeline = pipeline_with(http_judge(&server), AuditRecorder::in_memory(10));

    let event = pipeline
        .decide(&request("w1", "Run command `make lint`? (y/n)"), scope(&tmp))
        .await;

    assert_eq!(event.decided_by, DecidedBy::Template);
    assert_eq!(event.verdict, Verdict::Deny);
}

#[tokio::test]
async fn low_risk_network_access_is_preapproved_by_template() {
    let tmp = TempDir::new().unwrap();
    let pipeline = offline_pipeline();
    let req = request("w1", "Fetch https://example.com/data.json? (y/n)");
    assert_eq!(req.category, Category::NetworkAccess);

    let event = pipeline.decide(&req, scope(&tmp)).await;

    assert_eq!(event.verdict, Verdict::Approve);
    assert_eq!(event.decided_by, DecidedBy::Template);
    assert!(event.is_fallback);
}

#[tokio::test]
async fn ambiguous_prompt_is_denied_without_approval() {
    let tmp = TempDir::new().unwrap();
    let pipeline = offline_pipeline();
    let req = request("w1", "Proceed with deploy? (y/n)");
    assert_eq!(req.category, Category::Other);
    assert_eq!(req.risk_level, RiskLevel::High);

    let event = pipeline.decide(&req, scope(&tmp)).await;

    assert_eq!(event.verdict, Verdict::Deny);
    assert_eq!(event.decided_by, DecidedBy::Policy);
}

#[tokio::test]
async fn rule_verdicts_are_stable_across_replays() {
    let tmp = TempDir::new().unwrap();
    let pipeline = offline_pipeline();
    let req = request("w1", "Run command `git status`? (y/n)");

    let mut verdicts = Vec::new();
    for _ in 0..5 {
        let event = pipeline.decide(&req, scope(&tmp)).await;
        assert_eq!(event.decided_by, DecidedBy::Rules);
        verdicts.push(event.verdict);
    }
    assert!(verdicts.iter().all(|v| *v == Verdict::Approve));
    assert_eq!(pipeline.recorder().get_current_metrics().total_decisions, 5);
}
