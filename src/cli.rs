//! Command-line surface: a deterministic simulation of a degrading task run
//! through the full loop, and a reader for a persisted SQLite history.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::GovernorConfig;
use crate::control::{ControlLoop, CycleOutcome, CycleRecord, PerformanceSummary};
use crate::error::Result;
use crate::model::{ModelConfig, SimulatedModel, TaskKind, TrainableModel};
use crate::self_modify::safety::ConstraintSet;
use crate::self_modify::store::{MemoryStore, SqliteStore, VersionStore};
use crate::self_tune::feedback::TriggerDecision;
use crate::self_tune::metric_store::Observation;
use crate::self_tune::shadow::{ReplayTraffic, TrafficSample};
use crate::self_tune::version::{Version, VersionState};

#[derive(Parser, Debug)]
#[command(name = "adaptive-governor")]
#[command(version)]
#[command(about = "Validated, revertible self-modification for a trainable model")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a simulated task that degrades mid-stream and print the audit trail
    Simulate(SimulateArgs),
    /// Print versions and cycle records from a SQLite store
    History(HistoryArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Governor configuration (TOML); defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Constraint set (TOML); a built-in set applies when omitted
    #[arg(long)]
    pub constraints: Option<PathBuf>,

    /// Persist versions and cycles to this SQLite file instead of memory
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Number of observations to stream
    #[arg(long, default_value = "1500")]
    pub observations: u32,

    /// Observation index at which the task's optimum shifts
    #[arg(long, default_value = "300")]
    pub degrade_at: u32,

    /// Seed for the simulated traffic
    #[arg(long, default_value = "7")]
    pub seed: u64,

    /// Task identifier
    #[arg(long, default_value = "t1")]
    pub task: String,

    /// Emit the report as JSON instead of colored text
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct HistoryArgs {
    /// SQLite file written by `simulate --db`
    #[arg(long)]
    pub db: PathBuf,

    /// Restrict output to one task
    #[arg(long)]
    pub task: Option<String>,

    #[arg(long)]
    pub json: bool,
}

/// Used when `--constraints` is not given.
pub const DEFAULT_CONSTRAINTS: &str = r#"
version = 1

[[constraints]]
name = "learning_rate_range"
kind = "bounded_range"
param = "learning_rate"
min = 0.0001
max = 1.0

[[constraints]]
name = "depth_range"
kind = "bounded_range"
param = "arch.layers"
min = 1.0
max = 6.0

[[constraints]]
name = "step_size"
kind = "max_deviation"
limit = 1.0

[[constraints]]
name = "sgd_high_lr"
kind = "forbidden_combination"
predicates = [
  { when = "option_equals", key = "optimizer", value = "sgd" },
  { when = "param_above", param = "learning_rate", value = 0.5 },
]
"#;

// ---------------------------------------------------------------------------
// simulate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub task_id: String,
    pub observations: u32,
    pub triggers: usize,
    pub records: Vec<CycleRecord>,
    pub versions: Vec<Version>,
    pub summary: PerformanceSummary,
}

fn initial_config() -> ModelConfig {
    ModelConfig::default()
        .with_param("learning_rate", 0.1)
        .with_layers(&[32, 32])
        .with_option("optimizer", "adam")
}

fn load_constraints(path: Option<&Path>) -> Result<ConstraintSet> {
    match path {
        Some(p) => ConstraintSet::from_file(p),
        None => ConstraintSet::from_toml_str(DEFAULT_CONSTRAINTS),
    }
}

/// Stream `args.observations` predictions through the loop.  At
/// `args.degrade_at` the task's optimum learning rate drops tenfold, so the
/// active configuration starts to miss and the loop has to adapt.
pub async fn run_simulation(args: &SimulateArgs) -> Result<SimulationReport> {
    let config = match &args.config {
        Some(p) => GovernorConfig::from_file(p)?,
        None => GovernorConfig::default(),
    };
    let constraints = load_constraints(args.constraints.as_deref())?;
    let store: Arc<dyn VersionStore> = match &args.db {
        Some(p) => Arc::new(SqliteStore::open(p)?),
        None => Arc::new(MemoryStore::new()),
    };

    let task = args.task.as_str();
    let model = Arc::new(SimulatedModel::new());
    model.add_task(task, TaskKind::Classification, initial_config(), 0.1);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mirrored: Vec<TrafficSample> = (0..config.shadow.max_samples)
        .map(|_| {
            let target = if rng.gen_bool(0.5) { 1.0 } else { 0.0 };
            TrafficSample { input: vec![target, rng.gen::<f64>()], actual: target }
        })
        .collect();
    let traffic = Arc::new(ReplayTraffic::new().with_samples(task, mirrored));

    let lp = ControlLoop::new(config, constraints, model.clone(), traffic, store)?;
    lp.register_task(task, TaskKind::Classification, initial_config())?;

    let mut triggers = 0;
    let mut records = Vec::new();
    for i in 0..args.observations {
        if i == args.degrade_at {
            model.set_optimum(task, 0.01);
            tracing::info!(target: "governor::control", task_id = task, at = i, "simulated drift");
        }
        let active = lp.get_active_version(task)?;
        let target = if rng.gen_bool(0.5) { 1.0 } else { 0.0 };
        let predicted = model.predict(task, &active.config, &[target, rng.gen::<f64>()])?;
        let obs = Observation::new(task, TaskKind::Classification, u64::from(i) * 1_000, predicted, Some(target));

        if let TriggerDecision::Improve(ticket) = lp.observe(obs)? {
            triggers += 1;
            records.push(lp.run_cycle(ticket).await);
        }
    }
    lp.shutdown()?;

    Ok(SimulationReport {
        task_id: task.to_string(),
        observations: args.observations,
        triggers,
        records,
        versions: lp.get_versions(task)?,
        summary: lp.summary(task)?,
    })
}

// ---------------------------------------------------------------------------
// history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TaskHistory {
    pub task_id: String,
    pub versions: Vec<Version>,
    pub cycles: Vec<CycleRecord>,
}

pub fn load_history(args: &HistoryArgs) -> Result<Vec<TaskHistory>> {
    let store = SqliteStore::open_existing(&args.db)?;
    let mut out: Vec<TaskHistory> = Vec::new();
    for v in store.load_versions()? {
        if args.task.as_deref().is_some_and(|t| t != v.task_id) {
            continue;
        }
        match out.iter_mut().find(|h| h.task_id == v.task_id) {
            Some(h) => h.versions.push(v),
            None => out.push(TaskHistory { task_id: v.task_id.clone(), versions: vec![v], cycles: Vec::new() }),
        }
    }
    for h in &mut out {
        h.cycles = store.load_cycles(&h.task_id)?;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn outcome_label(outcome: CycleOutcome) -> ColoredString {
    match outcome {
        CycleOutcome::Committed => "COMMITTED".bright_green().bold(),
        CycleOutcome::Rejected => "REJECTED".bright_yellow(),
        CycleOutcome::Error => "ERROR".bright_red().bold(),
    }
}

fn state_label(state: VersionState) -> ColoredString {
    match state {
        VersionState::Active => "active".bright_green(),
        VersionState::Superseded => "superseded".normal(),
        VersionState::Reverted => "reverted".bright_red(),
    }
}

pub fn print_cycles(records: &[CycleRecord]) {
    println!("{}", "Cycles".bright_cyan().bold());
    if records.is_empty() {
        println!("  (none)");
    }
    for r in records {
        let strategy = r.strategy.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "  #{:<4} {:<10} {:<20} {:<20} {}",
            r.cycle_id,
            outcome_label(r.final_outcome),
            r.trigger_reason.to_string().bright_white(),
            strategy,
            r.detail.as_deref().unwrap_or("")
        );
        if let Some(shadow) = &r.shadow_verdict {
            println!("        shadow: {shadow}");
        }
        if let Some(v) = r.committed_version_id {
            println!("        -> version {}", v.to_string().bright_green());
        }
    }
}

pub fn print_versions(versions: &[Version]) {
    println!("{}", "Versions".bright_cyan().bold());
    for v in versions {
        let parent = v.parent_id.map(|p| format!("v{p}")).unwrap_or_else(|| "root".into());
        let change = v.modification.as_ref().map(|m| m.describe()).unwrap_or_default();
        println!("  v{:<4} {:<12} parent {:<6} {}", v.id, state_label(v.state), parent, change);
    }
}

pub fn print_summary(s: &PerformanceSummary) {
    println!("{}", "Summary".bright_cyan().bold());
    println!("  {}: {}", "Task".bright_yellow(), s.task_id);
    println!("  {}: v{}", "Active".bright_yellow(), s.active_version);
    println!(
        "  {}: {} total, {} committed, {} rejected, {} errored ({:.0}% success)",
        "Cycles".bright_yellow(),
        s.cycles,
        s.committed,
        s.rejected,
        s.errored,
        s.success_rate * 100.0
    );
    for (kind, n) in &s.by_kind {
        println!("  {}: {}", kind.bright_white(), n);
    }
    println!("  {}: {}", "Ladder".bright_yellow(), s.ladder);
}

pub fn print_report(report: &SimulationReport) {
    println!("{}", "ADAPTIVE GOVERNOR SIMULATION".bright_cyan().bold());
    println!(
        "{}: {} observations, {} triggers",
        "Run".bright_yellow(),
        report.observations,
        report.triggers
    );
    println!("{}", "=".repeat(50).bright_blue());
    print_cycles(&report.records);
    print_versions(&report.versions);
    print_summary(&report.summary);
}

pub fn print_history(history: &[TaskHistory]) {
    for h in history {
        println!("{} {}", "Task".bright_cyan().bold(), h.task_id.bright_white());
        print_versions(&h.versions);
        print_cycles(&h.cycles);
        println!("{}", "=".repeat(50).bright_blue());
    }
}
