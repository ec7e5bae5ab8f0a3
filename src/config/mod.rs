//! TOML configuration: loading, validation and conversion into the
//! runtime settings of each subsystem.

pub mod schema;

pub use schema::{
    AgentConfig, AuditConfig, BreakerSection, Config, FallbackConfig, JudgeConfig, LoggingConfig,
    PolicyConfig, PoolConfig, RetrySection,
};

use anyhow::Context;
use directories::BaseDirs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditRecorder;
use crate::decision::{DecisionPipeline, HttpJudge, Judge, TemplateFallback, UnavailableJudge};
use crate::error::ConfigError;
use crate::matcher::{Category, RiskProfile};
use crate::policy::RuleSetHandle;
use crate::pool::PoolSettings;
use crate::resilience::{BreakerConfig, CircuitBreaker, RetryPolicy};
use crate::session::SessionConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// `<config_dir>/fleetpilot/config.toml`, when a config dir exists.
pub fn default_config_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.config_dir().join("fleetpilot").join("config.toml"))
}

/// Expand a leading `~` in a configured path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

pub fn parse_category(name: &str) -> Option<Category> {
    Category::ALL
        .into_iter()
        .find(|category| category.to_string() == name.trim())
}

impl Config {
    /// Load `path`, or the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to load config file {}", path.display()))?;
        config.config_path = Some(path);
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if self.agent.command.trim().is_empty() {
            return invalid("agent.command must not be empty".into());
        }
        if self.pool.max_concurrent == 0 {
            return invalid("pool.max_concurrent must be at least 1".into());
        }
        if self.pool.idle_timeout_secs == 0 {
            return invalid("pool.idle_timeout_secs must be at least 1".into());
        }
        if self.pool.max_duration_secs == Some(0) {
            return invalid("pool.max_duration_secs must be at least 1 when set".into());
        }
        if self.pool.output_limit_lines == 0 {
            return invalid("pool.output_limit_lines must be at least 1".into());
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be at least 1".into());
        }
        if self.breaker.half_open_max_calls == 0 {
            return invalid("breaker.half_open_max_calls must be at least 1".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid(format!(
                "retry.base_delay_ms ({}) must be <= retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }
        if self.judge.enabled {
            if self.judge.endpoint.trim().is_empty() {
                return invalid("judge.endpoint must be set when the judge is enabled".into());
            }
            if self.judge.timeout_ms == 0 {
                return invalid("judge.timeout_ms must be at least 1".into());
            }
            if !(0.0..=2.0).contains(&self.judge.temperature) {
                return invalid("judge.temperature must be in [0.0, 2.0]".into());
            }
        }
        if let Some(unknown) = self
            .fallback
            .allow_categories
            .iter()
            .find(|name| parse_category(name).is_none())
        {
            return invalid(format!("fallback.allow_categories: unknown category `{unknown}`"));
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return invalid(format!(
                "logging.level must be one of {}",
                LOG_LEVELS.join(", ")
            ));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            args: self.agent.args.clone(),
            env: self.agent.env.clone(),
            task_as_arg: self.agent.task_as_arg,
            flush_timeout: millis(self.pool.flush_timeout_ms),
            terminate_grace: millis(self.pool.terminate_grace_ms),
            prompt_settle: millis(self.pool.prompt_settle_ms),
            ..SessionConfig::new(expand_path(&self.agent.command).to_string_lossy())
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        let defaults = PoolSettings::default();
        PoolSettings {
            max_concurrent: self.pool.max_concurrent,
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            max_duration: self.pool.max_duration_secs.map(Duration::from_secs),
            output_limit_lines: self.pool.output_limit_lines,
            workspace_root: self
                .pool
                .workspace_root
                .as_deref()
                .map_or(defaults.workspace_root, expand_path),
            approved_by: self.policy.approved_by.clone(),
            retry: self.retry_policy(),
            retry_transient_crashes: self.retry.retry_transient_crashes,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            recovery_timeout: millis(self.breaker.recovery_timeout_ms),
            half_open_max_calls: self.breaker.half_open_max_calls,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: millis(self.retry.base_delay_ms),
            max_delay: millis(self.retry.max_delay_ms),
        }
    }

    pub fn template_fallback(&self) -> TemplateFallback {
        TemplateFallback::new(
            self.fallback
                .allow_categories
                .iter()
                .filter_map(|name| parse_category(name))
                .collect(),
        )
    }

    pub fn risk_profile(&self) -> RiskProfile {
        RiskProfile {
            system_paths: self.policy.forbidden_paths.clone(),
            dangerous_fragments: self.policy.dangerous_commands.clone(),
        }
    }

    pub fn rules_dir(&self) -> Option<PathBuf> {
        self.policy.rules_dir.as_deref().map(expand_path)
    }

    pub fn audit_log_path(&self) -> Option<PathBuf> {
        self.audit.log_path.as_deref().map(expand_path)
    }

    /// Load the configured rule files into a swappable handle.
    pub fn load_rules(&self) -> Result<RuleSetHandle, ConfigError> {
        let rules = crate::policy::loader::load(
            self.rules_dir().as_deref(),
            self.policy.include_builtin,
        )?;
        tracing::info!(
            allow_rules = rules.allow_rule_count(),
            decision_rules = rules.rules.len(),
            "policy rules loaded"
        );
        Ok(RuleSetHandle::new(rules))
    }

    /// Re-read the configured rule files into `handle`; the active set survives a failure.
    pub fn reload_rules(&self, handle: &RuleSetHandle) -> Result<(), ConfigError> {
        let Some(dir) = self.rules_dir() else {
            return Err(ConfigError::Validation(
                "rule reload needs [policy] rules_dir".into(),
            ));
        };
        handle.reload(&dir, self.policy.include_builtin)
    }

    /// The configured judge, or one that is always unavailable.
    pub fn judge(&self) -> Arc<dyn Judge> {
        if !self.judge.enabled {
            return Arc::new(UnavailableJudge);
        }
        let api_key = std::env::var(&self.judge.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            tracing::warn!(
                env = self.judge.api_key_env.as_str(),
                "judge API key not set, sending unauthenticated requests"
            );
        }
        Arc::new(HttpJudge::new(
            &self.judge.endpoint,
            &self.judge.model,
            api_key,
            self.judge.temperature,
        ))
    }

    pub fn audit_recorder(&self) -> Result<AuditRecorder, ConfigError> {
        match self.audit_log_path() {
            Some(path) => Ok(AuditRecorder::open(&path, self.audit.recent_capacity)?),
            None => Ok(AuditRecorder::in_memory(self.audit.recent_capacity)),
        }
    }

    /// Assemble the decision pipeline: rules, judge, breaker, fallback, recorder.
    pub fn decision_pipeline(&self) -> Result<DecisionPipeline, ConfigError> {
        let rules = self.load_rules()?;
        let breaker = Arc::new(CircuitBreaker::new("judge", self.breaker_config()));
        let recorder = Arc::new(self.audit_recorder()?);
        Ok(
            DecisionPipeline::new(rules, self.judge(), breaker, recorder)
                .with_judge_timeout(millis(self.judge.timeout_ms))
                .with_fallback(self.template_fallback())
                .with_risk_profile(self.risk_profile()),
        )
    }
}
