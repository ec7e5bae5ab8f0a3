use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::Display;

use super::condition::Condition;
use crate::decision::rules::DecisionRule;
use crate::error::ConfigError;
use crate::matcher::{Category, RiskLevel};

/// Resource classes the gate keeps a default-deny policy for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceClass {
    /// Sandbox execution: shell commands, package installs.
    Sandbox,
    /// Filesystem writes and deletes.
    Filesystem,
    Network,
}

impl ResourceClass {
    /// `Other` has no class and therefore no possible allow-exception.
    pub fn for_category(category: Category) -> Option<Self> {
        match category {
            Category::FileWrite | Category::FileDelete => Some(Self::Filesystem),
            Category::BashExec | Category::PackageInstall => Some(Self::Sandbox),
            Category::NetworkAccess => Some(Self::Network),
            Category::Other => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AllowRule {
    pub name: String,
    /// Risk bands this exception covers; empty covers none.
    pub risks: Vec<RiskLevel>,
    pub when: Condition,
}

#[derive(Debug, Clone, Default)]
pub struct ResourcePolicy {
    pub allow: Vec<AllowRule>,
}

/// Complete, immutable rule table shared by the Policy Gate and the Rule Matcher.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub policies: BTreeMap<ResourceClass, ResourcePolicy>,
    pub rules: Vec<DecisionRule>,
    /// Files the set was assembled from, in load order.
    pub sources: Vec<PathBuf>,
}

impl RuleSet {
    pub fn policy(&self, class: ResourceClass) -> Option<&ResourcePolicy> {
        self.policies.get(&class)
    }

    /// Append `other` after `self`: decision rules keep order, allow lists concatenate.
    pub fn merge(&mut self, other: Self) {
        for (class, policy) in other.policies {
            self.policies
                .entry(class)
                .or_default()
                .allow
                .extend(policy.allow);
        }
        self.rules.extend(other.rules);
        self.sources.extend(other.sources);
    }

    pub fn allow_rule_count(&self) -> usize {
        self.policies.values().map(|p| p.allow.len()).sum()
    }
}

/// Live rule-set holder.
///
/// Wraps `RuleSet` in an `ArcSwap` so readers never block and never see a
/// half-updated table; a reload either swaps in a complete new set or
/// leaves the previous one active.
pub struct RuleSetHandle {
    inner: Arc<ArcSwap<RuleSet>>,
}

impl RuleSetHandle {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(rules)),
        }
    }

    /// Load current snapshot. Lock-free.
    pub fn load(&self) -> arc_swap::Guard<Arc<RuleSet>> {
        self.inner.load()
    }

    pub fn load_full(&self) -> Arc<RuleSet> {
        self.inner.load_full()
    }

    pub fn store(&self, rules: RuleSet) {
        self.inner.store(Arc::new(rules));
    }

    /// Rebuild from `dir` and swap atomically; on error the active set is kept.
    pub fn reload(&self, dir: &Path, include_builtin: bool) -> Result<(), ConfigError> {
        match super::loader::load(Some(dir), include_builtin) {
            Ok(fresh) => {
                tracing::info!(
                    dir = %dir.display(),
                    rules = fresh.rules.len(),
                    allow_rules = fresh.allow_rule_count(),
                    "rule-set reloaded"
                );
                self.store(fresh);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "rule-set reload failed, keeping previous: {e}");
                Err(e)
            }
        }
    }
}

impl Clone for RuleSetHandle {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
