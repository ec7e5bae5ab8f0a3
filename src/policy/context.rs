use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::matcher::{self, ConfirmationRequest, RiskProfile};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Text(String),
}

/// Facts a rule condition can refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionContext {
    values: BTreeMap<String, ContextValue>,
}

impl ActionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bool(mut self, name: &str, value: bool) -> Self {
        self.values.insert(name.to_string(), ContextValue::Bool(value));
        self
    }

    pub fn with_text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values
            .insert(name.to_string(), ContextValue::Text(value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ContextValue> {
        self.values.get(name)
    }

    /// Booleans are themselves; text is true when non-empty; missing is false.
    pub fn truthy(&self, name: &str) -> bool {
        match self.values.get(name) {
            Some(ContextValue::Bool(b)) => *b,
            Some(ContextValue::Text(t)) => !t.is_empty(),
            None => false,
        }
    }

    /// Text view of a fact; booleans render as `true`/`false`, missing as "".
    pub fn text(&self, name: &str) -> Cow<'_, str> {
        match self.values.get(name) {
            Some(ContextValue::Text(t)) => Cow::Borrowed(t.as_str()),
            Some(ContextValue::Bool(b)) => Cow::Owned(b.to_string()),
            None => Cow::Borrowed(""),
        }
    }

    pub fn approved_by(&self) -> Option<&str> {
        match self.values.get("approved_by") {
            Some(ContextValue::Text(t)) if !t.trim().is_empty() => Some(t.as_str()),
            _ => None,
        }
    }

    /// Derive the standard fact set for a confirmation raised inside `workspace`.
    pub fn for_request(
        request: &ConfirmationRequest,
        workspace: &Path,
        approved_by: Option<&str>,
        profile: &RiskProfile,
    ) -> Self {
        let target = request.target.clone().unwrap_or_default();
        let in_workspace = request.category.touches_filesystem()
            && !target.is_empty()
            && is_within_workspace(&target, workspace);
        let forbidden_path = request.category.touches_filesystem()
            && !target.is_empty()
            && !in_workspace
            && matcher::is_system_path(&target, &profile.system_paths);
        let dangerous_command = request.category.runs_commands()
            && matcher::has_dangerous_fragment(&target, &profile.dangerous_fragments);

        let mut ctx = Self::new()
            .with_text("category", request.category.to_string())
            .with_text("risk", request.risk_level.to_string())
            .with_text("target", target.clone())
            .with_text("worker_id", request.worker_id.clone())
            .with_text("signature", request.signature.clone())
            .with_bool("has_target", !target.is_empty())
            .with_bool("in_workspace", in_workspace)
            .with_bool("forbidden_path", forbidden_path)
            .with_bool("dangerous_command", dangerous_command);
        if let Some(who) = approved_by {
            ctx = ctx.with_text("approved_by", who);
        }
        ctx
    }
}

/// Lexical containment check: relative targets resolve against `workspace`,
/// `..` components are folded, symlinks are not followed.
pub fn is_within_workspace(target: &str, workspace: &Path) -> bool {
    if target.contains('\0') {
        return false;
    }
    let expanded = shellexpand::tilde(target);
    let candidate = Path::new(expanded.as_ref());
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workspace.join(candidate)
    };
    let Some(resolved) = normalize(&joined) else {
        return false;
    };
    [Some(workspace.to_path_buf()), workspace.canonicalize().ok()]
        .into_iter()
        .flatten()
        .filter_map(|root| normalize(&root))
        .any(|root| resolved.starts_with(root))
}

fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}
