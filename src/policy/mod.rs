//! Policy gate (pipeline stage 1).
//!
//! Every resource class is default-deny; an action passes only when an
//! allow-exception for its class covers the action's risk level and its
//! condition holds for the action context. High-risk actions additionally
//! need an `approved_by` fact.

pub mod condition;
pub mod context;
pub mod defaults;
pub mod loader;
pub mod ruleset;

pub use condition::Condition;
pub use context::ActionContext;
pub use ruleset::{ResourceClass, RuleSet, RuleSetHandle};

use serde::Serialize;

use crate::matcher::{Category, RiskLevel};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyVerdict {
    pub allowed: bool,
    pub reasons: Vec<String>,
    pub violations: Vec<String>,
}

impl PolicyVerdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reasons: vec![reason.into()],
            violations: Vec::new(),
        }
    }

    pub fn deny(violation: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reasons: Vec::new(),
            violations: vec![violation.into()],
        }
    }

    /// One-line summary suitable for an audit `reasoning` field.
    pub fn summary(&self) -> String {
        if self.allowed {
            self.reasons.join("; ")
        } else {
            self.violations.join("; ")
        }
    }
}

#[derive(Clone)]
pub struct PolicyGate {
    rules: RuleSetHandle,
}

impl PolicyGate {
    pub fn new(rules: RuleSetHandle) -> Self {
        Self { rules }
    }

    pub fn evaluate(&self, action: Category, resource: &str, ctx: &ActionContext) -> PolicyVerdict {
        let risk = parse_risk(&ctx.text("risk"));

        let Some(class) = ResourceClass::for_category(action) else {
            return PolicyVerdict::deny(format!(
                "{action} on `{resource}` has no resource class; unclassified actions are denied"
            ));
        };

        let snapshot = self.rules.load();
        let Some(policy) = snapshot.policy(class) else {
            return PolicyVerdict::deny(format!("no policy declared for resource class {class}"));
        };

        let Some(rule) = policy
            .allow
            .iter()
            .find(|rule| rule.risks.contains(&risk) && rule.when.evaluate(ctx))
        else {
            let mut verdict = PolicyVerdict::deny(format!(
                "{action} on `{resource}` at {risk} risk matches no allow rule for {class}"
            ));
            if ctx.truthy("forbidden_path") {
                verdict.violations.push(format!("`{resource}` is a protected system path"));
            }
            if ctx.truthy("dangerous_command") {
                verdict
                    .violations
                    .push(format!("`{resource}` contains a destructive command fragment"));
            }
            return verdict;
        };

        if risk == RiskLevel::High {
            let Some(approver) = ctx.approved_by() else {
                return PolicyVerdict::deny(format!(
                    "high-risk {action} on `{resource}` requires approved_by"
                ));
            };
            let mut verdict = PolicyVerdict::allow(format!("allowed by `{}`", rule.name));
            verdict.reasons.push(format!("high risk approved by {approver}"));
            return verdict;
        }

        PolicyVerdict::allow(format!("allowed by `{}`", rule.name))
    }
}

/// Unknown or missing risk is treated as the most severe level.
fn parse_risk(raw: &str) -> RiskLevel {
    match raw {
        "low" => RiskLevel::Low,
        "medium" => RiskLevel::Medium,
        _ => RiskLevel::High,
    }
}
