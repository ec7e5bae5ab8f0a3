use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cli::commands::{Cli, Commands};
use fleetpilot::audit::{Metrics, read_log};
use fleetpilot::config::Config;
use fleetpilot::decision::DecisionPipeline;
use fleetpilot::matcher::PatternMatcher;
use fleetpilot::pool::{Task, TaskOutcome, TaskResult, WorkerPool};

pub async fn dispatch(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run {
            tasks,
            tasks_file,
            max_concurrent,
            json,
        } => run_tasks(config, tasks, tasks_file.as_deref(), max_concurrent, json).await,
        Commands::CheckRules { dir, no_builtin } => check_rules(&dir, !no_builtin),
        Commands::Audit { limit, log } => show_audit(&audit_log(&config, log)?, limit),
        Commands::Metrics { log } => show_metrics(&audit_log(&config, log)?),
    }
}

fn audit_log(config: &Config, explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit.or_else(|| config.audit_log_path()) {
        Some(path) => Ok(path),
        None => bail!("no audit log configured; set [audit] log_path or pass --log"),
    }
}

/// Task descriptions from `--task` plus one per non-empty, non-comment line of the file.
fn collect_tasks(mut tasks: Vec<String>, tasks_file: Option<&Path>) -> Result<Vec<String>> {
    if let Some(path) = tasks_file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tasks file {}", path.display()))?;
        tasks.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from),
        );
    }
    tasks.retain(|task| !task.trim().is_empty());
    Ok(tasks)
}

async fn run_tasks(
    mut config: Config,
    tasks: Vec<String>,
    tasks_file: Option<&Path>,
    max_concurrent: Option<usize>,
    json: bool,
) -> Result<()> {
    let descriptions = collect_tasks(tasks, tasks_file)?;
    if descriptions.is_empty() {
        bail!("no tasks given; use --task or --tasks-file");
    }
    if let Some(limit) = max_concurrent {
        config.pool.max_concurrent = limit;
        config.validate()?;
    }

    let pipeline = Arc::new(
        config
            .decision_pipeline()
            .context("Failed to assemble decision pipeline")?,
    );
    let matcher = Arc::new(PatternMatcher::new(config.risk_profile()));
    let pool = WorkerPool::new(
        config.pool_settings(),
        config.session_config(),
        matcher,
        Arc::clone(&pipeline),
    );

    let reloader = reload_on_hangup(config.clone(), Arc::clone(&pipeline))?;

    let handles = descriptions
        .into_iter()
        .map(|description| pool.submit(Task::new(description)))
        .collect::<Result<Vec<_>, _>>()?;
    info!(tasks = handles.len(), "tasks submitted");

    let results = tokio::select! {
        results = pool.await_all(&handles) => results?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, cancelling tasks");
            pool.shutdown().await;
            pool.await_all(&handles).await?
        }
    };
    pool.shutdown().await;
    reloader.abort();

    for result in &results {
        if json {
            println!("{}", serde_json::to_string(result)?);
        } else {
            print_result(result);
        }
    }

    let metrics = pipeline.recorder().get_current_metrics();
    info!(
        decisions = metrics.total_decisions,
        approvals = metrics.approvals,
        denials = metrics.denials,
        template_fallbacks = metrics.template_fallbacks,
        "run finished"
    );

    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        bail!("{failed} of {} tasks did not succeed", results.len());
    }
    Ok(())
}

/// Reload the rule files into the live pipeline on every SIGHUP.
fn reload_on_hangup(config: Config, pipeline: Arc<DecisionPipeline>) -> Result<JoinHandle<()>> {
    let mut hangups = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    Ok(tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            info!("SIGHUP received, reloading rules");
            if let Err(e) = config.reload_rules(pipeline.rules()) {
                warn!("rule reload rejected, previous rules stay active: {e}");
            }
        }
    }))
}

fn print_result(result: &TaskResult) {
    let marker = match result.outcome {
        TaskOutcome::Succeeded => "ok",
        TaskOutcome::Failed => "FAILED",
        TaskOutcome::TimedOut => "TIMED OUT",
        TaskOutcome::Cancelled => "cancelled",
    };
    println!(
        "{} [{marker}] {:.1}s, {} attempt(s)",
        result.task_id,
        result.duration.as_secs_f64(),
        result.attempts
    );
    if let Some(error) = &result.error {
        println!("  error: {error}");
    }
}

fn check_rules(dir: &Path, include_builtin: bool) -> Result<()> {
    let rules = fleetpilot::policy::loader::load(Some(dir), include_builtin)
        .with_context(|| format!("Rule check failed for {}", dir.display()))?;
    for source in &rules.sources {
        println!("loaded {}", source.display());
    }
    println!(
        "{} resource policies, {} allow rules, {} decision rules",
        rules.policies.len(),
        rules.allow_rule_count(),
        rules.rules.len()
    );
    Ok(())
}

fn show_audit(path: &Path, limit: usize) -> Result<()> {
    let events = read_log(path)
        .with_context(|| format!("Failed to read audit log {}", path.display()))?;
    let skip = events.len().saturating_sub(limit);
    for event in events.iter().skip(skip) {
        println!(
            "{} {:<10} {:<15} {:<8} {:<7} {:>8.1}ms  {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.worker_id,
            event.confirmation_category.to_string(),
            event.decided_by.to_string(),
            event.verdict.to_string(),
            event.latency_ms,
            event.reasoning
        );
    }
    Ok(())
}

fn show_metrics(path: &Path) -> Result<()> {
    let events = read_log(path)
        .with_context(|| format!("Failed to read audit log {}", path.display()))?;
    let metrics = Metrics::from_events(&events);
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tasks_file_skips_blanks_and_comments() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tasks.txt");
        std::fs::write(&path, "# batch\nfix lint\n\n  add tests  \n").unwrap();
        let tasks = collect_tasks(vec!["first".into()], Some(&path)).unwrap();
        assert_eq!(tasks, ["first", "fix lint", "add tests"]);
    }

    #[test]
    fn missing_tasks_file_is_reported() {
        let err = collect_tasks(Vec::new(), Some(Path::new("/nonexistent/tasks.txt"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read tasks file"));
    }

    #[tokio::test]
    async fn hangup_reloads_rules_into_the_live_pipeline() {
        use fleetpilot::decision::{DecidedBy, DecisionScope, Verdict};
        use fleetpilot::matcher::PatternMatcher;
        use nix::sys::signal::{Signal, raise};
        use std::time::Duration;

        let rules_dir = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        std::fs::write(rules_dir.path().join("00-empty.toml"), "").unwrap();
        let config = Config::from_toml(&format!(
            "[policy]\nrules_dir = {:?}\n",
            rules_dir.path().display().to_string()
        ))
        .unwrap();
        let pipeline = Arc::new(config.decision_pipeline().unwrap());
        let reloader = reload_on_hangup(config, Arc::clone(&pipeline)).unwrap();

        let line = b"Write to file Cargo.lock? (y/n)\n";
        let events = PatternMatcher::default().classify("w1", line, Vec::new()).events;
        let request = events[0].confirmation().unwrap().clone();
        let scope = DecisionScope {
            workspace: workspace.path(),
            approved_by: None,
        };
        assert_eq!(pipeline.decide(&request, scope).await.verdict, Verdict::Approve);

        std::fs::write(
            rules_dir.path().join("10-lockfiles.toml"),
            "[[rule]]\nname = \"lockfiles\"\ncategories = [\"file_write\"]\ntarget = '\\.lock$'\nverdict = \"deny\"\n",
        )
        .unwrap();
        raise(Signal::SIGHUP).unwrap();

        let mut denied = None;
        for _ in 0..100 {
            let event = pipeline.decide(&request, scope).await;
            if event.verdict == Verdict::Deny {
                denied = Some(event);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let denied = denied.expect("reload never took effect");
        assert_eq!(denied.decided_by, DecidedBy::Rules);
        reloader.abort();
    }

    #[test]
    fn audit_log_requires_a_path() {
        assert!(audit_log(&Config::default(), None).is_err());
        let explicit = audit_log(&Config::default(), Some(PathBuf::from("/tmp/a.jsonl"))).unwrap();
        assert_eq!(explicit, PathBuf::from("/tmp/a.jsonl"));
    }
}
