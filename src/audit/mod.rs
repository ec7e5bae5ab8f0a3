//! Audit/Metrics Recorder.
//!
//! Appends one JSON line per [`DecisionEvent`] and keeps rolling counters
//! plus a bounded ring of recent decisions for the metrics surface. Log
//! appends run on the blocking pool and serialize on the file's own mutex,
//! so lines never interleave and async workers never block on disk.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::decision::{DecidedBy, DecisionEvent, Verdict};

/// Read-only snapshot of decision statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_decisions: u64,
    pub decisions_by_source: BTreeMap<DecidedBy, u64>,
    pub template_fallbacks: u64,
    pub average_latency_ms: f64,
    pub approvals: u64,
    pub denials: u64,
    pub policy_evaluations: u64,
    pub policy_denials: u64,
}

impl Metrics {
    /// Recompute from a decision log. Every decision passes the gate once,
    /// so gate counters follow from the decisions themselves.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a DecisionEvent>) -> Self {
        let mut totals = Totals::default();
        for event in events {
            totals.observe(event);
            totals.policy_evaluations += 1;
            if event.decided_by == DecidedBy::Policy {
                totals.policy_denials += 1;
            }
        }
        totals.metrics()
    }
}

#[derive(Debug, Default)]
struct Totals {
    total: u64,
    by_source: BTreeMap<DecidedBy, u64>,
    template_fallbacks: u64,
    latency_sum_ms: f64,
    approvals: u64,
    denials: u64,
    policy_evaluations: u64,
    policy_denials: u64,
}

impl Totals {
    fn observe(&mut self, event: &DecisionEvent) {
        self.total += 1;
        *self.by_source.entry(event.decided_by).or_default() += 1;
        if event.is_fallback {
            self.template_fallbacks += 1;
        }
        self.latency_sum_ms += event.latency_ms;
        match event.verdict {
            Verdict::Approve => self.approvals += 1,
            Verdict::Deny => self.denials += 1,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn metrics(&self) -> Metrics {
        Metrics {
            total_decisions: self.total,
            decisions_by_source: self.by_source.clone(),
            template_fallbacks: self.template_fallbacks,
            average_latency_ms: if self.total == 0 {
                0.0
            } else {
                self.latency_sum_ms / self.total as f64
            },
            approvals: self.approvals,
            denials: self.denials,
            policy_evaluations: self.policy_evaluations,
            policy_denials: self.policy_denials,
        }
    }
}

struct Stats {
    recent: VecDeque<DecisionEvent>,
    totals: Totals,
}

pub struct AuditRecorder {
    log_path: Option<PathBuf>,
    log: Option<Arc<Mutex<File>>>,
    capacity: usize,
    stats: Mutex<Stats>,
}

impl AuditRecorder {
    /// Recorder appending to `log_path`; parent directories are created.
    pub fn open(log_path: &Path, recent_capacity: usize) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        Ok(Self::with_file(Some(file), Some(log_path.to_path_buf()), recent_capacity))
    }

    /// Recorder without a durable log; metrics and recent decisions only.
    pub fn in_memory(recent_capacity: usize) -> Self {
        Self::with_file(None, None, recent_capacity)
    }

    fn with_file(file: Option<File>, log_path: Option<PathBuf>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            log_path,
            log: file.map(|file| Arc::new(Mutex::new(file))),
            capacity,
            stats: Mutex::new(Stats {
                recent: VecDeque::with_capacity(capacity),
                totals: Totals::default(),
            }),
        }
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `event` to the log and fold it into the statistics.
    ///
    /// The line is on disk when this returns. A failed write is logged; the
    /// decision still counts.
    pub async fn record(&self, event: &DecisionEvent) {
        if let Some(log) = &self.log {
            let written = match serde_json::to_string(event) {
                Ok(line) => {
                    let log = Arc::clone(log);
                    tokio::task::spawn_blocking(move || append_line(&log, &line))
                        .await
                        .unwrap_or_else(|e| Err(std::io::Error::other(e)))
                }
                Err(e) => Err(std::io::Error::other(e)),
            };
            if let Err(e) = written {
                tracing::error!(worker_id = event.worker_id.as_str(), "audit log write failed: {e}");
            }
        }

        let mut stats = self.stats();
        stats.totals.observe(event);
        if stats.recent.len() == self.capacity {
            stats.recent.pop_front();
        }
        stats.recent.push_back(event.clone());
    }

    /// Count one Policy Gate evaluation without creating a decision.
    pub fn record_policy_evaluation(&self, allowed: bool) {
        let mut stats = self.stats();
        stats.totals.policy_evaluations += 1;
        if !allowed {
            stats.totals.policy_denials += 1;
        }
    }

    pub fn get_current_metrics(&self) -> Metrics {
        self.stats().totals.metrics()
    }

    /// Up to `limit` most recent decisions, oldest first.
    pub fn get_recent_decisions(&self, limit: usize) -> Vec<DecisionEvent> {
        let stats = self.stats();
        let skip = stats.recent.len().saturating_sub(limit);
        stats.recent.iter().skip(skip).cloned().collect()
    }
}

fn append_line(log: &Mutex<File>, line: &str) -> std::io::Result<()> {
    let mut file = log.lock().unwrap_or_else(PoisonError::into_inner);
    file.write_all(format!("{line}\n").as_bytes())?;
    file.flush()
}

/// Read every decision from a JSONL audit log, skipping unparsable lines.
pub fn read_log(path: &Path) -> std::io::Result<Vec<DecisionEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DecisionEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!(line = idx + 1, "skipping malformed audit record: {e}"),
        }
    }
    Ok(events)
}
