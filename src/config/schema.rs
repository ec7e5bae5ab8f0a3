use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::matcher::Category;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path this config was read from; not serialized.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub judge: JudgeConfig,

    #[serde(default)]
    pub breaker: BreakerSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ── Agent subprocess ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable launched for every task (default: "claude")
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Pass the task description as the last argument instead of on stdin
    #[serde(default)]
    pub task_as_arg: bool,
}

fn default_agent_command() -> String {
    "claude".into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
            env: BTreeMap::new(),
            task_as_arg: false,
        }
    }
}

// ── Worker pool ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Seconds without output before a worker is timed out
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Overall wall-clock limit per task; unset means unlimited
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// Quiet period before an unterminated prompt is promoted; 0 disables
    #[serde(default)]
    pub prompt_settle_ms: u64,
    #[serde(default = "default_output_limit_lines")]
    pub output_limit_lines: usize,
    /// Parent of per-task workspaces (default: system temp dir)
    #[serde(default)]
    pub workspace_root: Option<String>,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_flush_timeout_ms() -> u64 {
    2_000
}

fn default_terminate_grace_ms() -> u64 {
    3_000
}

fn default_output_limit_lines() -> usize {
    2_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_duration_secs: None,
            flush_timeout_ms: default_flush_timeout_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            prompt_settle_ms: 0,
            output_limit_lines: default_output_limit_lines(),
            workspace_root: None,
        }
    }
}

// ── Policy ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Directory of `*.toml` rule files
    #[serde(default)]
    pub rules_dir: Option<String>,
    /// Merge the built-in rules after file rules (default: true)
    #[serde(default = "default_true")]
    pub include_builtin: bool,
    #[serde(default = "crate::policy::defaults::default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,
    #[serde(default = "crate::policy::defaults::default_dangerous_commands")]
    pub dangerous_commands: Vec<String>,
    /// Operator identity recorded as approval for high-risk actions
    #[serde(default)]
    pub approved_by: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules_dir: None,
            include_builtin: true,
            forbidden_paths: crate::policy::defaults::default_forbidden_paths(),
            dangerous_commands: crate::policy::defaults::default_dangerous_commands(),
            approved_by: None,
        }
    }
}

// ── AI judge ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// OpenAI-compatible base URL
    #[serde(default = "default_judge_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_judge_model")]
    pub model: String,
    /// Environment variable holding the bearer token
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_judge_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub temperature: f64,
}

fn default_judge_endpoint() -> String {
    "https://api.openai.com/v1".into()
}

fn default_judge_model() -> String {
    "gpt-4o-mini".into()
}

fn default_api_key_env() -> String {
    "FLEETPILOT_JUDGE_API_KEY".into()
}

fn default_judge_timeout_ms() -> u64 {
    10_000
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_judge_endpoint(),
            model: default_judge_model(),
            api_key_env: default_api_key_env(),
            timeout_ms: default_judge_timeout_ms(),
            temperature: 0.0,
        }
    }
}

// ── Circuit breaker ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

// ── Worker retry ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Retry workers that crash before any verdict was delivered
    #[serde(default)]
    pub retry_transient_crashes: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_transient_crashes: false,
        }
    }
}

// ── Template fallback ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Categories approved at low risk when the judge is unavailable
    #[serde(default = "default_fallback_categories")]
    pub allow_categories: Vec<String>,
}

fn default_fallback_categories() -> Vec<String> {
    vec![Category::NetworkAccess.to_string()]
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            allow_categories: default_fallback_categories(),
        }
    }
}

// ── Audit ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSONL decision log; unset keeps decisions in memory only
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

fn default_recent_capacity() -> usize {
    1_000
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            recent_capacity: default_recent_capacity(),
        }
    }
}

// ── Logging ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
