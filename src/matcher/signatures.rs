//! Ordered prompt-signature table.
//!
//! Every entry is anchored to a complete line. A signature names the
//! category it recognises (or `Directive`, whose category comes from the
//! action word inside the fence), and exposes a `kw` capture whose length is
//! its specificity when several signatures match the same line.

use std::sync::LazyLock;

use regex::Regex;

use super::types::Category;

/// Prompt terminator shared by the action signatures: `? (y/n)`, `? [Y/n]`,
/// `? (yes/no)`, optionally followed by a colon.
const TERMINATOR: &str = r"\?\s*(?:\((?:y/n|yes/no)\)|\[(?:y/n)\])\s*:?\s*$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// ```` ```confirm <action> <target>``` ```` single-line fenced directive.
    Directive,
    /// Natural-language prompt for one category.
    Action(Category),
    /// Any other line ending in a yes/no terminator.
    Generic,
}

#[derive(Debug)]
pub struct Signature {
    pub name: &'static str,
    pub kind: SignatureKind,
    pub pattern: Regex,
}

/// A successful signature match on one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMatch {
    pub name: &'static str,
    pub category: Category,
    pub target: Option<String>,
    pub specificity: usize,
}

impl Signature {
    fn new(name: &'static str, kind: SignatureKind, pattern: &str) -> Self {
        Self {
            name,
            kind,
            pattern: Regex::new(pattern).expect("prompt signature must compile"),
        }
    }

    pub fn matches(&self, line: &str) -> Option<SignatureMatch> {
        let caps = self.pattern.captures(line)?;
        let keyword = caps.name("kw").map_or("", |m| m.as_str());
        let target = caps
            .name("target")
            .map(|m| m.as_str().trim().trim_matches('`').to_string())
            .filter(|t| !t.is_empty());

        let category = match self.kind {
            SignatureKind::Directive => directive_category(keyword),
            SignatureKind::Action(category) => category,
            SignatureKind::Generic => Category::Other,
        };
        let specificity = match self.kind {
            SignatureKind::Generic => 0,
            // A directive is an explicit, fully literal request.
            SignatureKind::Directive => usize::MAX,
            SignatureKind::Action(_) => keyword.len(),
        };

        Some(SignatureMatch {
            name: self.name,
            category,
            target,
            specificity,
        })
    }
}

fn directive_category(action: &str) -> Category {
    match action.to_ascii_lowercase().as_str() {
        "write" | "edit" | "create" => Category::FileWrite,
        "delete" | "remove" => Category::FileDelete,
        "exec" | "run" => Category::BashExec,
        "install" => Category::PackageInstall,
        "fetch" | "network" => Category::NetworkAccess,
        _ => Category::Other,
    }
}

fn action(verbs: &str, noun: &str, target: &str) -> String {
    format!(r"(?i)\b(?P<kw>{verbs})\b(?:\s+(?:the\s+)?(?:{noun}))?:?\s+`?(?P<target>{target})`?\s*{TERMINATOR}")
}

pub static SIGNATURES: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    vec![
        Signature::new(
            "fenced_directive",
            SignatureKind::Directive,
            r"(?i)^\s*```confirm\s+(?P<kw>[a-z]+)\s+(?P<target>\S.*?)\s*```\s*$",
        ),
        Signature::new(
            "file_delete",
            SignatureKind::Action(Category::FileDelete),
            &action(r"delete|remove|rm|unlink", r"file|directory|folder", r"[^\s`?]+"),
        ),
        Signature::new(
            "file_write",
            SignatureKind::Action(Category::FileWrite),
            &action(
                r"overwrite|write\s+to|write|create|edit|modify|save\s+to|save",
                r"file",
                r"[^\s`?]+",
            ),
        ),
        Signature::new(
            "package_install",
            SignatureKind::Action(Category::PackageInstall),
            &action(r"install", r"packages?|dependency|dependencies", r"[^`?]+?"),
        ),
        Signature::new(
            "bash_exec",
            SignatureKind::Action(Category::BashExec),
            &action(r"run|execute", r"shell\s+command|command|script", r"[^`?]+?"),
        ),
        Signature::new(
            "network_access",
            SignatureKind::Action(Category::NetworkAccess),
            &action(
                r"fetch|download|connect\s+to|access|request",
                r"url|host|resource",
                r"[a-z][a-z0-9+.-]*://[^\s`?]+|[\w-]+(?:\.[\w-]+)+(?::\d+)?(?:/[^\s`?]*)?",
            ),
        ),
        Signature::new(
            "generic_yes_no",
            SignatureKind::Generic,
            &format!(r"(?i)(?P<kw>){TERMINATOR}"),
        ),
    ]
});

static PROMPT_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(TERMINATOR).expect("prompt terminator must compile"));

/// Whether `text` stops exactly at a yes/no prompt terminator.
pub fn ends_at_terminator(text: &str) -> bool {
    PROMPT_END.is_match(text)
}

static HEARTBEAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏◐◓◑◒|/\\-]+|\.{3,}|(?:still\s+)?(?:thinking|working)(?:\.{3}|…)?|\[heartbeat\])\s*$",
    )
    .expect("heartbeat signature must compile")
});

static TASK_COMPLETE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:✓\s*)?(?:task\s+(?:complete|completed|done|finished)|all\s+done)\b")
        .expect("completion signature must compile")
});

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:✗\s*)?(?:error|fatal|panic(?:ked)?)\b").expect("error signature must compile")
});

pub fn is_heartbeat(line: &str) -> bool {
    HEARTBEAT.is_match(line)
}

pub fn is_task_complete(line: &str) -> bool {
    TASK_COMPLETE.is_match(line)
}

pub fn is_error(line: &str) -> bool {
    ERROR_LINE.is_match(line)
}
