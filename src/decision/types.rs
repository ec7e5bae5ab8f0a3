use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::matcher::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Verdict {
    Approve,
    Deny,
}

/// Pipeline stage that produced the final verdict.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecidedBy {
    Policy,
    Rules,
    Ai,
    Template,
}

/// Durable audit record; one per confirmation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub timestamp: DateTime<Utc>,
    pub worker_id: String,
    pub confirmation_category: Category,
    pub decided_by: DecidedBy,
    pub verdict: Verdict,
    pub latency_ms: f64,
    pub is_fallback: bool,
    pub reasoning: String,
}

impl DecisionEvent {
    pub fn approved(&self) -> bool {
        self.verdict == Verdict::Approve
    }
}
