use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `fleetpilot`.
///
/// Each subsystem defines its own error variant. Per-worker failures are
/// folded into that worker's `TaskResult` by the pool; only pool-wide
/// conditions (for example a missing rule-set) reach the caller as errors.
#[derive(Debug, Error)]
pub enum PilotError {
    // ── Config / rule-set ───────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Worker spawn ────────────────────────────────────────────────────
    #[error("spawn: {0}")]
    Spawn(#[from] SpawnError),

    // ── Pseudo-session ──────────────────────────────────────────────────
    #[error("session: {0}")]
    Session(#[from] SessionError),

    // ── AI judgment ─────────────────────────────────────────────────────
    #[error("judgment: {0}")]
    Judgment(#[from] JudgmentError),

    // ── Worker pool ─────────────────────────────────────────────────────
    #[error("pool: {0}")]
    Pool(#[from] PoolError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rule file {}: {message}", path.display())]
    RuleFile { path: PathBuf, message: String },

    #[error("condition `{source_text}` at offset {offset}: {message}")]
    Condition {
        source_text: String,
        offset: usize,
        message: String,
    },

    #[error("no rule files found in {}", .0.display())]
    NoRuleSet(PathBuf),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Spawn errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("agent executable not found: {program}")]
    ExecutableNotFound { program: String },

    #[error("workspace {} could not be prepared: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start agent: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent stdio handle unavailable: {0}")]
    Stdio(&'static str),
}

impl SpawnError {
    /// Whether a fresh attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::ExecutableNotFound { .. })
    }
}

// ─── Session errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no qualifying output within {0:?}")]
    Timeout(Duration),

    #[error("agent exited abnormally: {0}")]
    Crash(String),

    #[error("input flush exceeded {0:?}")]
    WriteTimeout(Duration),

    #[error("agent input stream is closed")]
    StdinClosed,

    #[error("confirmation is awaiting a verdict")]
    VerdictPending,

    #[error("no confirmation is pending")]
    NoPendingConfirmation,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Judgment errors ─────────────────────────────────────────────────────────

/// Reasons the AI judgment stage produced no verdict. Never surfaced to
/// callers; every variant routes the request to the template fallback.
#[derive(Debug, Error)]
pub enum JudgmentError {
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("judgment timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed judgment: {0}")]
    Malformed(String),

    #[error("judgment transport: {0}")]
    Transport(String),

    #[error("judgment disabled")]
    Disabled,
}

// ─── Pool errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("task not found: {0}")]
    UnknownTask(String),

    #[error("pool is shut down")]
    ShutDown,
}

/// Convenience alias used by library code that returns `PilotError`.
pub type Result<T> = std::result::Result<T, PilotError>;
