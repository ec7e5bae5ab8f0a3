use std::sync::Arc;

use fleetpilot::audit::AuditRecorder;
use fleetpilot::config::Config;
use fleetpilot::decision::{DecidedBy, DecisionPipeline, DecisionScope, UnavailableJudge, Verdict};
use fleetpilot::error::ConfigError;
use fleetpilot::policy::RuleSetHandle;
use fleetpilot::policy::loader;
use fleetpilot::resilience::{BreakerConfig, CircuitBreaker};
use tempfile::TempDir;

use crate::fleet::request;

const LOCKFILE_RULES: &str = r#"
[[rule]]
name = "lockfiles are generated"
categories = ["file_write"]
target = '\.lock$'
verdict = "deny"
"#;

fn pipeline(rules: RuleSetHandle) -> DecisionPipeline {
    DecisionPipeline::new(
        rules,
        Arc::new(UnavailableJudge),
        Arc::new(CircuitBreaker::new("judge", BreakerConfig::default())),
        Arc::new(AuditRecorder::in_memory(10)),
    )
}

#[tokio::test]
async fn reload_swaps_rules_for_subsequent_decisions() {
    let workspace = TempDir::new().unwrap();
    let rules_dir = TempDir::new().unwrap();
    let scope = DecisionScope {
        workspace: workspace.path(),
        approved_by: None,
    };
    let handle = RuleSetHandle::new(loader::load(None, true).unwrap());
    let pipeline = pipeline(handle.clone());
    let req = request("w1", "Write to file Cargo.lock? (y/n)");

    let before = pipeline.decide(&req, scope).await;
    assert_eq!(before.verdict, Verdict::Approve);

    std::fs::write(rules_dir.path().join("10-lockfiles.toml"), LOCKFILE_RULES).unwrap();
    handle.reload(rules_dir.path(), true).unwrap();

    let after = pipeline.decide(&req, scope).await;
    assert_eq!(after.verdict, Verdict::Deny);
    assert_eq!(after.decided_by, DecidedBy::Rules);
    assert!(after.reasoning.contains("lockfiles are generated"));
}

#[tokio::test]
async fn failed_reload_keeps_the_active_rules() {
    let workspace = TempDir::new().unwrap();
    let rules_dir = TempDir::new().unwrap();
    std::fs::write(rules_dir.path().join("10-lockfiles.toml"), LOCKFILE_RULES).unwrap();
    let handle = RuleSetHandle::new(loader::load(Some(rules_dir.path()), true).unwrap());
    let pipeline = pipeline(handle.clone());

    std::fs::write(
        rules_dir.path().join("20-broken.toml"),
        "[[resource]]\nclass = \"filesystem\"\ndefault = \"allow\"\n",
    )
    .unwrap();
    let err = handle.reload(rules_dir.path(), true).unwrap_err();
    assert!(matches!(err, ConfigError::RuleFile { .. }));

    let event = pipeline
        .decide(
            &request("w1", "Write to file Cargo.lock? (y/n)"),
            DecisionScope {
                workspace: workspace.path(),
                approved_by: None,
            },
        )
        .await;
    assert_eq!(event.verdict, Verdict::Deny);
    assert_eq!(event.decided_by, DecidedBy::Rules);
}

#[tokio::test]
async fn configured_reload_updates_a_running_pipeline() {
    let workspace = TempDir::new().unwrap();
    let rules_dir = TempDir::new().unwrap();
    std::fs::write(rules_dir.path().join("00-base.toml"), "").unwrap();
    let config = Config::from_toml(&format!(
        "[policy]\nrules_dir = {:?}\n",
        rules_dir.path().display().to_string()
    ))
    .unwrap();
    let pipeline = config.decision_pipeline().unwrap();
    let scope = DecisionScope {
        workspace: workspace.path(),
        approved_by: None,
    };
    let req = request("w1", "Write to file Cargo.lock? (y/n)");
    assert_eq!(pipeline.decide(&req, scope).await.verdict, Verdict::Approve);

    std::fs::write(rules_dir.path().join("10-lockfiles.toml"), LOCKFILE_RULES).unwrap();
    config.reload_rules(pipeline.rules()).unwrap();
    assert_eq!(pipeline.decide(&req, scope).await.verdict, Verdict::Deny);

    std::fs::write(rules_dir.path().join("20-broken.toml"), "[[rule]]\nname = ").unwrap();
    assert!(config.reload_rules(pipeline.rules()).is_err());
    let kept = pipeline.decide(&req, scope).await;
    assert_eq!(kept.verdict, Verdict::Deny);
    assert!(kept.reasoning.contains("lockfiles are generated"));
}

#[test]
fn reload_without_rules_dir_is_rejected() {
    let config = Config::default();
    let handle = RuleSetHandle::new(loader::load(None, true).unwrap());
    assert!(matches!(
        config.reload_rules(&handle),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn empty_rules_directory_is_fatal() {
    let rules_dir = TempDir::new().unwrap();
    let err = loader::load(Some(rules_dir.path()), true).unwrap_err();
    assert!(matches!(err, ConfigError::NoRuleSet(_)));
}

#[test]
fn bad_condition_is_reported_at_load_time() {
    let rules_dir = TempDir::new().unwrap();
    std::fs::write(
        rules_dir.path().join("net.toml"),
        r#"
[[resource]]
class = "network"
default = "deny"

[[resource.allow]]
name = "broken"
when = 'risk == '
"#,
    )
    .unwrap();
    let err = loader::load(Some(rules_dir.path()), false).unwrap_err();
    assert!(err.to_string().contains("broken"), "{err}");
}
