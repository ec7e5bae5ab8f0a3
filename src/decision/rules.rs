//! Deterministic rule matcher (pipeline stage 2).
//!
//! An ordered table of `(category, risk, target pattern, workspace)` rules;
//! first match wins and no match falls through to AI judgment.

use regex::Regex;

use super::types::Verdict;
use crate::matcher::{Category, ConfirmationRequest, RiskLevel};
use crate::policy::context::ActionContext;
use crate::policy::ruleset::RuleSetHandle;

#[derive(Debug, Clone)]
pub struct DecisionRule {
    pub name: String,
    /// Empty matches every category.
    pub categories: Vec<Category>,
    /// Empty matches every risk level.
    pub risks: Vec<RiskLevel>,
    pub target: Option<Regex>,
    pub within_workspace: Option<bool>,
    pub verdict: Verdict,
}

impl DecisionRule {
    pub fn matches(&self, request: &ConfirmationRequest, ctx: &ActionContext) -> bool {
        if !self.categories.is_empty() && !self.categories.contains(&request.category) {
            return false;
        }
        if !self.risks.is_empty() && !self.risks.contains(&request.risk_level) {
            return false;
        }
        if let Some(expected) = self.within_workspace
            && ctx.truthy("in_workspace") != expected
        {
            return false;
        }
        match (&self.target, request.target.as_deref()) {
            (None, _) => true,
            (Some(pattern), Some(target)) => pattern.is_match(target),
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule: String,
    pub verdict: Verdict,
}

/// First rule in `rules` that matches, if any.
pub fn first_match(
    rules: &[DecisionRule],
    request: &ConfirmationRequest,
    ctx: &ActionContext,
) -> Option<RuleMatch> {
    rules
        .iter()
        .find(|rule| rule.matches(request, ctx))
        .map(|rule| RuleMatch {
            rule: rule.name.clone(),
            verdict: rule.verdict,
        })
}

/// Rule matcher reading the live rule-set snapshot.
#[derive(Clone)]
pub struct RuleMatcher {
    rules: RuleSetHandle,
}

impl RuleMatcher {
    pub fn new(rules: RuleSetHandle) -> Self {
        Self { rules }
    }

    pub fn evaluate(&self, request: &ConfirmationRequest, ctx: &ActionContext) -> Option<RuleMatch> {
        let snapshot = self.rules.load();
        first_match(&snapshot.rules, request, ctx)
    }
}
