//! Rule-file loading.
//!
//! Every `*.toml` file in the rules directory contributes resource policies
//! (`[[resource]]`, each default-deny with allow-exceptions) and ordered
//! decision rules (`[[rule]]`). Files load in name order; built-in rules, when
//! enabled, are appended last so operator rules win on first match.

use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::condition::Condition;
use super::defaults::default_read_only_commands;
use super::ruleset::{AllowRule, ResourceClass, ResourcePolicy, RuleSet};
use crate::decision::Verdict;
use crate::decision::rules::DecisionRule;
use crate::error::ConfigError;
use crate::matcher::{Category, RiskLevel};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default)]
    resource: Vec<ResourceSection>,
    #[serde(default)]
    rule: Vec<RuleSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceSection {
    class: ResourceClass,
    default: DefaultEffect,
    #[serde(default)]
    allow: Vec<AllowSection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DefaultEffect {
    Deny,
    Allow,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AllowSection {
    name: String,
    #[serde(default)]
    risk: Vec<RiskLevel>,
    when: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSection {
    name: String,
    #[serde(default)]
    categories: Vec<Category>,
    #[serde(default)]
    risk: Vec<RiskLevel>,
    target: Option<String>,
    within_workspace: Option<bool>,
    verdict: Verdict,
}

/// Build the active rule-set from `dir` (if any) plus the built-in rules.
pub fn load(dir: Option<&Path>, include_builtin: bool) -> Result<RuleSet, ConfigError> {
    let mut set = RuleSet::default();

    if let Some(dir) = dir {
        let files = rule_files(dir)?;
        if files.is_empty() {
            return Err(ConfigError::NoRuleSet(dir.to_path_buf()));
        }
        for path in files {
            let contents = std::fs::read_to_string(&path)?;
            set.merge(parse_rule_file(&contents, &path)?);
        }
    }

    if include_builtin {
        set.merge(RuleSet::builtin());
    }

    if set.policies.is_empty() && set.rules.is_empty() {
        return Err(ConfigError::Validation(
            "no rule source: set policy.rules_dir or enable policy.include_builtin".into(),
        ));
    }

    tracing::debug!(
        files = set.sources.len(),
        rules = set.rules.len(),
        allow_rules = set.allow_rule_count(),
        "rule-set assembled"
    );
    Ok(set)
}

fn rule_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::RuleFile {
        path: dir.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parse and validate one rule file. Nothing partial is returned on error.
pub fn parse_rule_file(contents: &str, path: &Path) -> Result<RuleSet, ConfigError> {
    let file_error = |message: String| ConfigError::RuleFile {
        path: path.to_path_buf(),
        message,
    };

    let file: RuleFile = toml::from_str(contents).map_err(|e| file_error(e.to_string()))?;
    let mut set = RuleSet {
        sources: vec![path.to_path_buf()],
        ..RuleSet::default()
    };

    for resource in file.resource {
        if resource.default != DefaultEffect::Deny {
            return Err(file_error(format!(
                "resource `{}` must declare default = \"deny\"",
                resource.class
            )));
        }
        let mut policy = ResourcePolicy::default();
        for allow in resource.allow {
            let when = Condition::parse(&allow.when)
                .map_err(|e| file_error(format!("allow `{}`: {e}", allow.name)))?;
            policy.allow.push(AllowRule {
                name: allow.name,
                risks: allow.risk,
                when,
            });
        }
        set.policies
            .entry(resource.class)
            .or_default()
            .allow
            .extend(policy.allow);
    }

    for rule in file.rule {
        let target = rule
            .target
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| file_error(format!("rule `{}`: {e}", rule.name)))?;
        set.rules.push(DecisionRule {
            name: rule.name,
            categories: rule.categories,
            risks: rule.risk,
            target,
            within_workspace: rule.within_workspace,
            verdict: rule.verdict,
        });
    }

    Ok(set)
}

fn builtin_source() -> String {
    let read_only = default_read_only_commands()
        .iter()
        .map(|cmd| regex::escape(cmd))
        .collect::<Vec<_>>()
        .join("|");

    format!(
        r#"
[[resource]]
class = "filesystem"
default = "deny"

[[resource.allow]]
name = "paths outside system locations"
risk = ["low", "medium"]
when = '!forbidden_path'

[[resource]]
class = "sandbox"
default = "deny"

[[resource.allow]]
name = "non-destructive commands"
risk = ["low", "medium"]
when = '!dangerous_command'

[[resource]]
class = "network"
default = "deny"

[[resource.allow]]
name = "outbound requests"
risk = ["low", "medium"]
when = 'true'

[[rule]]
name = "system paths are read-only"
categories = ["file_write", "file_delete"]
target = '^(?:/etc|/usr|/bin|/sbin|/boot|/sys|/proc|/dev|/lib)(?:/|$)'
verdict = "deny"

[[rule]]
name = "workspace writes"
categories = ["file_write"]
risk = ["low", "medium"]
within_workspace = true
verdict = "approve"

[[rule]]
name = "read-only shell commands"
categories = ["bash_exec"]
risk = ["low", "medium"]
target = '^(?:{read_only})(?:\s+[^;&|<>`$()]*)?$'
verdict = "approve"
"#
    )
}

impl RuleSet {
    /// Default allow-list and decision rules shipped with the binary.
    pub fn builtin() -> Self {
        let mut set = parse_rule_file(&builtin_source(), Path::new("<builtin>"))
            .expect("built-in rule set must parse");
        set.sources.clear();
        set
    }
}
