use super::types::Verdict;
use crate::matcher::{Category, ConfirmationRequest, RiskLevel};

/// Static last-resort rule (pipeline stage 4): deny unless the category is
/// pre-approved and the request is low risk.
#[derive(Debug, Clone)]
pub struct TemplateFallback {
    allow_categories: Vec<Category>,
}

impl Default for TemplateFallback {
    fn default() -> Self {
        Self {
            allow_categories: vec![Category::NetworkAccess],
        }
    }
}

impl TemplateFallback {
    pub fn new(allow_categories: Vec<Category>) -> Self {
        Self { allow_categories }
    }

    pub fn allow_categories(&self) -> &[Category] {
        &self.allow_categories
    }

    pub fn decide(&self, request: &ConfirmationRequest) -> (Verdict, String) {
        if self.allow_categories.contains(&request.category)
            && request.risk_level == RiskLevel::Low
        {
            (
                Verdict::Approve,
                format!("template: {} is pre-approved at low risk", request.category),
            )
        } else {
            (
                Verdict::Deny,
                format!(
                    "template: {} at {} risk is not pre-approved",
                    request.category, request.risk_level
                ),
            )
        }
    }
}
