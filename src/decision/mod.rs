//! Decision Pipeline: resolves one confirmation to one verdict.
//!
//! Stages run in order and stop at the first definitive answer:
//! policy gate (deny is final), deterministic rules, AI judgment behind the
//! circuit breaker, template fallback. Exactly one [`DecisionEvent`] is
//! recorded per call.

pub mod fallback;
pub mod judge;
pub mod rules;
pub mod types;

pub use fallback::TemplateFallback;
pub use judge::{HttpJudge, Judge, Judgment, JudgmentRequest, UnavailableJudge};
pub use rules::{RuleMatch, RuleMatcher};
pub use types::{DecidedBy, DecisionEvent, Verdict};

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::AuditRecorder;
use crate::error::JudgmentError;
use crate::matcher::{ConfirmationRequest, RiskProfile};
use crate::policy::{ActionContext, PolicyGate, RuleSetHandle};
use crate::resilience::CircuitBreaker;

/// Per-worker facts the pipeline needs beyond the request itself.
#[derive(Debug, Clone, Copy)]
pub struct DecisionScope<'a> {
    pub workspace: &'a Path,
    pub approved_by: Option<&'a str>,
}

pub struct DecisionPipeline {
    rule_set: RuleSetHandle,
    gate: PolicyGate,
    rules: RuleMatcher,
    judge: Arc<dyn Judge>,
    breaker: Arc<CircuitBreaker>,
    judge_timeout: Duration,
    fallback: TemplateFallback,
    risk: RiskProfile,
    recorder: Arc<AuditRecorder>,
}

impl DecisionPipeline {
    pub fn new(
        rules: RuleSetHandle,
        judge: Arc<dyn Judge>,
        breaker: Arc<CircuitBreaker>,
        recorder: Arc<AuditRecorder>,
    ) -> Self {
        Self {
            gate: PolicyGate::new(rules.clone()),
            rules: RuleMatcher::new(rules.clone()),
            rule_set: rules,
            judge,
            breaker,
            judge_timeout: Duration::from_secs(10),
            fallback: TemplateFallback::default(),
            risk: RiskProfile::default(),
            recorder,
        }
    }

    #[must_use]
    pub fn with_judge_timeout(mut self, timeout: Duration) -> Self {
        self.judge_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: TemplateFallback) -> Self {
        self.fallback = fallback;
        self
    }

    #[must_use]
    pub fn with_risk_profile(mut self, risk: RiskProfile) -> Self {
        self.risk = risk;
        self
    }

    /// Shared handle to the live rule-set; reloading it affects every later decision.
    pub fn rules(&self) -> &RuleSetHandle {
        &self.rule_set
    }

    pub fn recorder(&self) -> &Arc<AuditRecorder> {
        &self.recorder
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn decide(
        &self,
        request: &ConfirmationRequest,
        scope: DecisionScope<'_>,
    ) -> DecisionEvent {
        let started = Instant::now();
        let ctx = ActionContext::for_request(request, scope.workspace, scope.approved_by, &self.risk);
        let resource = request.target.as_deref().unwrap_or(&request.message);

        let policy = self.gate.evaluate(request.category, resource, &ctx);
        self.recorder.record_policy_evaluation(policy.allowed);

        let (decided_by, verdict, reasoning) = if !policy.allowed {
            (DecidedBy::Policy, Verdict::Deny, policy.summary())
        } else if let Some(hit) = self.rules.evaluate(request, &ctx) {
            (DecidedBy::Rules, hit.verdict, format!("rule `{}`", hit.rule))
        } else {
            match self.escalate(request).await {
                Ok(judgment) => (DecidedBy::Ai, judgment.verdict, judgment.reasoning),
                Err(e) => {
                    tracing::warn!(
                        worker_id = request.worker_id.as_str(),
                        category = %request.category,
                        "judgment unavailable, using template fallback: {e}"
                    );
                    let (verdict, reasoning) = self.fallback.decide(request);
                    (DecidedBy::Template, verdict, format!("{reasoning} ({e})"))
                }
            }
        };

        let event = DecisionEvent {
            timestamp: Utc::now(),
            worker_id: request.worker_id.clone(),
            confirmation_category: request.category,
            decided_by,
            verdict,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            is_fallback: decided_by == DecidedBy::Template,
            reasoning,
        };
        self.recorder.record(&event).await;

        tracing::info!(
            worker_id = event.worker_id.as_str(),
            category = %event.confirmation_category,
            decided_by = %event.decided_by,
            verdict = %event.verdict,
            latency_ms = event.latency_ms,
            "confirmation resolved"
        );
        event
    }

    async fn escalate(&self, request: &ConfirmationRequest) -> Result<Judgment, JudgmentError> {
        self.breaker.try_acquire()?;

        let judgment_request = JudgmentRequest {
            worker_id: request.worker_id.clone(),
            category: request.category,
            risk_level: request.risk_level,
            message: request.message.clone(),
            target: request.target.clone(),
        };

        match tokio::time::timeout(self.judge_timeout, self.judge.judge(&judgment_request)).await {
            Ok(Ok(judgment)) => {
                self.breaker.record_success();
                Ok(judgment)
            }
            Ok(Err(JudgmentError::Disabled)) => Err(JudgmentError::Disabled),
            Ok(Err(e)) => {
                self.breaker.record_failure();
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(JudgmentError::Timeout(self.judge_timeout))
            }
        }
    }
}
