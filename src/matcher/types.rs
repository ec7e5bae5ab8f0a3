use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

/// What a confirmation prompt is asking permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    FileWrite,
    FileDelete,
    BashExec,
    PackageInstall,
    NetworkAccess,
    Other,
}

impl Category {
    pub const ALL: [Self; 6] = [
        Self::FileWrite,
        Self::FileDelete,
        Self::BashExec,
        Self::PackageInstall,
        Self::NetworkAccess,
        Self::Other,
    ];

    /// Risk assigned before any target-specific escalation.
    pub fn base_risk(self) -> RiskLevel {
        match self {
            Self::FileWrite | Self::NetworkAccess => RiskLevel::Low,
            Self::FileDelete | Self::BashExec | Self::PackageInstall => RiskLevel::Medium,
            Self::Other => RiskLevel::High,
        }
    }

    pub fn touches_filesystem(self) -> bool {
        matches!(self, Self::FileWrite | Self::FileDelete)
    }

    pub fn runs_commands(self) -> bool {
        matches!(self, Self::BashExec | Self::PackageInstall)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Text written back to the agent for each verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replies {
    pub approve: String,
    pub deny: String,
}

impl Default for Replies {
    fn default() -> Self {
        Self {
            approve: "y".into(),
            deny: "n".into(),
        }
    }
}

/// A point where the worker waits for approval before a risky action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    pub message: String,
    pub risk_level: RiskLevel,
    /// Path, command or URL the prompt names, when one could be extracted.
    pub target: Option<String>,
    /// Name of the prompt signature that recognised this request.
    pub signature: String,
    #[serde(default)]
    pub replies: Replies,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Line,
    ConfirmationRequest(ConfirmationRequest),
    Heartbeat,
    TaskComplete,
    Error,
    Eof,
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::ConfirmationRequest(_) => "confirmation_request",
            Self::Heartbeat => "heartbeat",
            Self::TaskComplete => "task_complete",
            Self::Error => "error",
            Self::Eof => "eof",
        }
    }
}

/// One classified unit of worker output. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub worker_id: String,
    /// Per-worker position in the stream, assigned by the owning session.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub raw_text: String,
}

impl OutputEvent {
    pub fn confirmation(&self) -> Option<&ConfirmationRequest> {
        match &self.kind {
            EventKind::ConfirmationRequest(request) => Some(request),
            _ => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, EventKind::Eof)
    }
}
