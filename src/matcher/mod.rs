//! Pattern Matcher: turns raw worker output into typed events.
//!
//! [`PatternMatcher::classify`] is a pure function over `(chunk, buffer)`:
//! it splits on `\n`, classifies every complete line, and hands back the
//! unterminated tail for the next call. Partial lines never produce events,
//! so feeding a prompt byte-by-byte yields exactly the events that feeding
//! it whole does.

pub mod ansi;
pub mod signatures;
pub mod types;

pub use types::{Category, ConfirmationRequest, EventKind, OutputEvent, Replies, RiskLevel};

use chrono::Utc;
use signatures::{SIGNATURES, SignatureMatch};
use std::path::{Component, Path};

/// Result of one `classify` call.
#[derive(Debug, Default)]
pub struct Classified {
    pub events: Vec<OutputEvent>,
    pub remaining: Vec<u8>,
}

/// Inputs for target-based risk escalation.
#[derive(Debug, Clone)]
pub struct RiskProfile {
    /// Path prefixes whose modification is always high risk.
    pub system_paths: Vec<String>,
    /// Command fragments that make any command high risk.
    pub dangerous_fragments: Vec<String>,
}

impl Default for RiskProfile {
    fn default() -> Self {
        Self {
            system_paths: crate::policy::defaults::default_forbidden_paths(),
            dangerous_fragments: crate::policy::defaults::default_dangerous_commands(),
        }
    }
}

/// Stateless line classifier shared by every session.
#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    risk: RiskProfile,
}

/// Classification of a single complete line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    Plain,
    Confirmation {
        category: Category,
        risk_level: RiskLevel,
        target: Option<String>,
        signature: &'static str,
    },
    Heartbeat,
    TaskComplete,
    Error,
}

impl PatternMatcher {
    pub fn new(risk: RiskProfile) -> Self {
        Self { risk }
    }

    /// Split `buffer + chunk` into complete-line events plus the leftover tail.
    pub fn classify(&self, worker_id: &str, chunk: &[u8], mut buffer: Vec<u8>) -> Classified {
        buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut line = &buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            events.push(self.event_for_line(worker_id, line));
            start = end + 1;
        }

        let remaining = buffer.split_off(start);
        Classified { events, remaining }
    }

    /// Promote an unterminated prompt once the stream has gone quiet.
    ///
    /// Agents commonly print `Continue? (y/n) ` without a newline. The
    /// session calls this after a settle interval; the partial is consumed
    /// only when it ends at a yes/no terminator and classifies as a
    /// confirmation, otherwise it is handed back intact.
    pub fn settle(&self, worker_id: &str, buffer: Vec<u8>) -> Classified {
        if buffer.is_empty() || !signatures::ends_at_terminator(&ansi::strip_ansi(&buffer)) {
            return Classified {
                events: Vec::new(),
                remaining: buffer,
            };
        }
        let event = self.event_for_line(worker_id, &buffer);
        if event.confirmation().is_some() {
            Classified {
                events: vec![event],
                remaining: Vec::new(),
            }
        } else {
            Classified {
                events: Vec::new(),
                remaining: buffer,
            }
        }
    }

    /// Flush whatever is left at end of stream and append the `Eof` marker.
    pub fn finish(&self, worker_id: &str, buffer: Vec<u8>) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        if !buffer.is_empty() {
            events.push(self.event_for_line(worker_id, &buffer));
        }
        events.push(OutputEvent {
            worker_id: worker_id.to_string(),
            seq: 0,
            timestamp: Utc::now(),
            kind: EventKind::Eof,
            raw_text: String::new(),
        });
        events
    }

    /// Classify one complete, already-decoded line.
    pub fn classify_line(&self, line: &str) -> LineClass {
        if let Some(found) = best_signature(line) {
            let risk_level = if found.ambiguous {
                RiskLevel::High
            } else {
                self.assess_risk(found.category, found.target.as_deref())
            };
            let category = if found.ambiguous {
                Category::Other
            } else {
                found.category
            };
            if found.ambiguous {
                tracing::debug!(line, "ambiguous prompt signature, treating as other/high");
            }
            return LineClass::Confirmation {
                category,
                risk_level,
                target: found.target,
                signature: found.name,
            };
        }
        if signatures::is_heartbeat(line) {
            LineClass::Heartbeat
        } else if signatures::is_task_complete(line) {
            LineClass::TaskComplete
        } else if signatures::is_error(line) {
            LineClass::Error
        } else {
            LineClass::Plain
        }
    }

    /// Category base risk, raised to high for system paths or dangerous commands.
    pub fn assess_risk(&self, category: Category, target: Option<&str>) -> RiskLevel {
        let base = category.base_risk();
        let Some(target) = target else {
            return base;
        };
        let escalated = if category.touches_filesystem() {
            is_system_path(target, &self.risk.system_paths)
        } else if category.runs_commands() {
            has_dangerous_fragment(target, &self.risk.dangerous_fragments)
        } else {
            false
        };
        if escalated { RiskLevel::High } else { base }
    }

    fn event_for_line(&self, worker_id: &str, line: &[u8]) -> OutputEvent {
        let raw_text = String::from_utf8_lossy(line).into_owned();
        let visible = ansi::strip_ansi(line);
        let timestamp = Utc::now();

        let kind = match self.classify_line(&visible) {
            LineClass::Plain => EventKind::Line,
            LineClass::Heartbeat => EventKind::Heartbeat,
            LineClass::TaskComplete => EventKind::TaskComplete,
            LineClass::Error => EventKind::Error,
            LineClass::Confirmation {
                category,
                risk_level,
                target,
                signature,
            } => EventKind::ConfirmationRequest(ConfirmationRequest {
                worker_id: worker_id.to_string(),
                timestamp,
                category,
                message: visible.trim().to_string(),
                risk_level,
                target,
                signature: signature.to_string(),
                replies: Replies::default(),
            }),
        };

        OutputEvent {
            worker_id: worker_id.to_string(),
            seq: 0,
            timestamp,
            kind,
            raw_text,
        }
    }
}

struct BestMatch {
    name: &'static str,
    category: Category,
    target: Option<String>,
    ambiguous: bool,
}

/// Most specific signature for `line`; equal specificity across different
/// categories is ambiguous.
fn best_signature(line: &str) -> Option<BestMatch> {
    let mut best: Option<SignatureMatch> = None;
    let mut ambiguous = false;

    for signature in SIGNATURES.iter() {
        let Some(candidate) = signature.matches(line) else {
            continue;
        };
        match &best {
            None => best = Some(candidate),
            Some(current) if candidate.specificity > current.specificity => {
                ambiguous = false;
                best = Some(candidate);
            }
            Some(current)
                if candidate.specificity == current.specificity
                    && candidate.category != current.category =>
            {
                ambiguous = true;
            }
            Some(_) => {}
        }
    }

    best.map(|m| BestMatch {
        name: m.name,
        category: m.category,
        target: m.target,
        ambiguous: ambiguous || m.category == Category::Other,
    })
}

/// Component-aware prefix test against `prefixes` (`~/` expanded).
pub fn is_system_path(target: &str, prefixes: &[String]) -> bool {
    let expanded = shellexpand::tilde(target);
    let path = Path::new(expanded.as_ref());
    if path.components().any(|c| matches!(c, Component::ParentDir)) && path.is_absolute() {
        return true;
    }
    prefixes.iter().any(|prefix| {
        let prefix = shellexpand::tilde(prefix);
        path.starts_with(Path::new(prefix.as_ref()))
    })
}

pub fn has_dangerous_fragment(command: &str, fragments: &[String]) -> bool {
    let lower = command.to_ascii_lowercase();
    fragments
        .iter()
        .any(|fragment| lower.contains(&fragment.to_ascii_lowercase()))
}
