//! CLI command definitions for clone-forge.
//!
//! `run` spins up a local runtime, pushes a batch of built-in clones through
//! the queue and reports how each one ended. `types` and `inspect` are
//! read-only views over the registry and the persisted snapshots.

use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::{json, Map};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::admin::CreateRequest;
use crate::clones::{CloneEventKind, CloneInfo, CloneRegistry, CloneStatus, EchoClone, SleepClone};
use crate::config::RuntimeConfig;
use crate::events::{Event, EventHandler};
use crate::runtime::CloneRuntime;

/// Default number of clones created by `run`.
const DEFAULT_COUNT: usize = 1;

/// Default overall deadline for `run`, in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Clone lifecycle runtime with a priority queue and a worker pool.
#[derive(Parser)]
#[command(name = "clone-forge")]
#[command(about = "Run and inspect managed clone units")]
#[command(version)]
#[command(
    long_about = "clone-forge drives clone units through their lifecycle: a priority queue feeds a resizable worker pool, and every transition is published on an event bus.\n\nConfiguration comes from CLONE_* environment variables (CLONE_REDIS_URL enables the shared Redis backend).\n\nExample usage:\n  clone-forge run --count 5 --kind sleep --priority 3"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create clones, run them through the worker pool and report their outcome.
    Run(RunArgs),

    /// List registered clone types.
    Types,

    /// List persisted clone snapshots.
    Inspect(InspectArgs),
}

/// Built-in clone kinds selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CloneKind {
    Echo,
    Sleep,
}

impl CloneKind {
    fn type_name(self) -> &'static str {
        match self {
            CloneKind::Echo => EchoClone::TYPE_NAME,
            CloneKind::Sleep => SleepClone::TYPE_NAME,
        }
    }
}

/// Arguments for `clone-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of clones to create.
    #[arg(short = 'n', long, default_value_t = DEFAULT_COUNT)]
    pub count: usize,

    /// Queue priority for every created clone (higher runs first).
    #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i64,

    /// Kind of built-in clone to run.
    #[arg(short, long, value_enum, default_value_t = CloneKind::Echo)]
    pub kind: CloneKind,

    /// Give up waiting for the clones after this many seconds.
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Message echoed by `echo` clones.
    #[arg(long, default_value = "hello")]
    pub message: String,

    /// How long each `sleep` clone runs, in seconds.
    #[arg(long, default_value_t = 1.0)]
    pub duration_secs: f64,

    /// Override the initial number of workers.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,

    /// Print the runtime metrics in Prometheus text format after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `clone-forge inspect`.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Only show snapshots with this status.
    #[arg(short, long)]
    pub status: Option<String>,

    /// Print the snapshots as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Outcome of one clone after `run`.
#[derive(Debug, Clone, Serialize)]
struct RunEntry {
    clone_id: String,
    status: CloneStatus,
    progress: f64,
    runtime_secs: Option<f64>,
    failure_reason: Option<String>,
}

impl From<CloneInfo> for RunEntry {
    fn from(info: CloneInfo) -> Self {
        Self {
            clone_id: info.clone_id,
            status: info.status,
            progress: info.progress,
            runtime_secs: info.runtime_secs,
            failure_reason: info.failure_reason,
        }
    }
}

/// Summary printed by `run`.
#[derive(Debug, Clone, Serialize)]
struct RunSummary {
    total: usize,
    completed: usize,
    failed: usize,
    unfinished: usize,
    timed_out: bool,
    clones: Vec<RunEntry>,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_clones_command(args).await,
        Commands::Types => run_types_command(),
        Commands::Inspect(args) => run_inspect_command(args).await,
    }
}

fn runtime_config(workers: Option<usize>) -> anyhow::Result<RuntimeConfig> {
    let mut config = RuntimeConfig::from_env()?;
    if let Some(workers) = workers {
        let max = config.max_workers.max(workers);
        let min = config.min_workers.min(workers.max(1));
        config = config.with_workers(min, workers, max);
        config.validate()?;
    }
    Ok(config)
}

fn clone_config(args: &RunArgs) -> Map<String, serde_json::Value> {
    let value = match args.kind {
        CloneKind::Echo => json!({ "message": args.message }),
        CloneKind::Sleep => json!({ "duration_secs": args.duration_secs }),
    };
    match value {
        serde_json::Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn run_clones_command(args: RunArgs) -> anyhow::Result<()> {
    if args.count == 0 {
        anyhow::bail!("--count must be at least 1");
    }

    let runtime = CloneRuntime::new(runtime_config(args.workers)?).await?;

    // Collect terminal events before any clone can finish.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut subscriptions = Vec::new();
    for kind in CloneEventKind::TERMINAL {
        let tx = tx.clone();
        subscriptions.push(runtime.bus().subscribe(
            kind.as_str(),
            EventHandler::sync(move |event: &Event| {
                if let Some(clone_id) = event.field_str("clone_id") {
                    // The receiver is gone once the run is over.
                    let _ = tx.send(clone_id.to_string());
                }
                Ok(())
            }),
        ));
    }
    drop(tx);

    let recovered = runtime.start().await?;
    if recovered > 0 {
        info!(recovered = recovered, "Recovered clones from a previous run");
    }

    let mut clone_ids = Vec::with_capacity(args.count);
    for _ in 0..args.count {
        let request = CreateRequest::new(args.kind.type_name())
            .with_config(clone_config(&args))
            .with_auto_start(args.priority);
        let info = runtime.admin().create(request).await?;
        clone_ids.push(info.clone_id);
    }
    info!(
        count = clone_ids.len(),
        kind = args.kind.type_name(),
        priority = args.priority,
        "Enqueued clones"
    );

    let deadline = Duration::from_secs(args.timeout_secs);
    let wait = async {
        let mut finished = 0;
        while finished < clone_ids.len() {
            match rx.recv().await {
                Some(clone_id) if clone_ids.contains(&clone_id) => finished += 1,
                Some(_) => {}
                None => break,
            }
        }
    };
    let timed_out = tokio::time::timeout(deadline, wait).await.is_err();
    if timed_out {
        warn!(timeout_secs = args.timeout_secs, "Timed out waiting for clones");
    }

    let clones: Vec<RunEntry> = clone_ids
        .iter()
        .filter_map(|id| runtime.admin().get(id).ok())
        .map(RunEntry::from)
        .collect();

    for subscription in &subscriptions {
        runtime.bus().unsubscribe(subscription, None);
    }
    if args.metrics {
        print!("{}", runtime.metrics().encode());
    }
    runtime.shutdown().await?;

    let count_status = |status: CloneStatus| clones.iter().filter(|c| c.status == status).count();
    let completed = count_status(CloneStatus::Completed);
    let failed = count_status(CloneStatus::Failed);
    let summary = RunSummary {
        total: clones.len(),
        completed,
        failed,
        unfinished: clones.iter().filter(|c| !c.status.is_terminal()).count(),
        timed_out,
        clones,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_run_summary(&summary);
    }

    if timed_out {
        anyhow::bail!(
            "{} of {} clones did not finish within {}s",
            summary.unfinished,
            summary.total,
            args.timeout_secs
        );
    }
    Ok(())
}

fn print_run_summary(summary: &RunSummary) {
    println!("\n=== Clone Run Results ===");
    println!("Total clones:   {}", summary.total);
    println!("Completed:      {}", summary.completed);
    println!("Failed:         {}", summary.failed);
    println!("Unfinished:     {}", summary.unfinished);
    println!();
    for entry in &summary.clones {
        let runtime = entry
            .runtime_secs
            .map(|secs| format!("{:.2}s", secs))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {:<11} progress={:.0}% runtime={}",
            entry.clone_id,
            entry.status.as_str(),
            entry.progress * 100.0,
            runtime
        );
        if let Some(reason) = &entry.failure_reason {
            println!("    error: {reason}");
        }
    }
}

fn run_types_command() -> anyhow::Result<()> {
    for name in CloneRegistry::with_builtins().type_names() {
        println!("{}", name);
    }
    Ok(())
}

async fn run_inspect_command(args: InspectArgs) -> anyhow::Result<()> {
    let status = args
        .status
        .as_deref()
        .map(CloneStatus::from_str)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;

    let runtime = CloneRuntime::new(runtime_config(None)?).await?;
    let snapshots: Vec<CloneInfo> = runtime
        .manager()
        .snapshots()
        .await?
        .into_iter()
        .filter(|info| status.map_or(true, |s| info.status == s))
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("No persisted clones");
        return Ok(());
    }
    for info in &snapshots {
        println!(
            "{} {:<11} type={} name={} created={}",
            info.clone_id,
            info.status.as_str(),
            info.clone_type,
            info.name,
            info.creation_time.to_rfc3339()
        );
        if let Some(reason) = &info.failure_reason {
            println!("    error: {reason}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["clone-forge", "run"]).expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.count, DEFAULT_COUNT);
                assert_eq!(args.priority, 0);
                assert_eq!(args.kind, CloneKind::Echo);
                assert_eq!(args.timeout_secs, DEFAULT_TIMEOUT_SECS);
                assert!(args.workers.is_none());
                assert!(!args.json);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_run_command_with_options() {
        let cli = Cli::try_parse_from([
            "clone-forge",
            "run",
            "--count",
            "5",
            "--priority",
            "-3",
            "--kind",
            "sleep",
            "--timeout-secs",
            "10",
            "--duration-secs",
            "0.5",
            "--workers",
            "4",
            "--json",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.count, 5);
                assert_eq!(args.priority, -3);
                assert_eq!(args.kind, CloneKind::Sleep);
                assert_eq!(args.timeout_secs, 10);
                assert!((args.duration_secs - 0.5).abs() < f64::EPSILON);
                assert_eq!(args.workers, Some(4));
                assert!(args.json);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_invalid_kind_is_rejected() {
        assert!(Cli::try_parse_from(["clone-forge", "run", "--kind", "quantum"]).is_err());
    }

    #[test]
    fn test_inspect_command() {
        let cli = Cli::try_parse_from(["clone-forge", "inspect", "--status", "failed"])
            .expect("should parse");
        match cli.command {
            Commands::Inspect(args) => assert_eq!(args.status.as_deref(), Some("failed")),
            _ => panic!("Expected Inspect command"),
        }
    }

    #[test]
    fn test_clone_config_per_kind() {
        let cli = Cli::try_parse_from(["clone-forge", "run", "--message", "hi"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("Expected Run command");
        };
        assert_eq!(clone_config(&args)["message"], "hi");

        let cli = Cli::try_parse_from(["clone-forge", "run", "-k", "sleep"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("Expected Run command");
        };
        assert_eq!(clone_config(&args)["duration_secs"], 1.0);
    }

    #[test]
    fn test_clone_kind_type_names() {
        assert_eq!(CloneKind::Echo.type_name(), "Echo");
        assert_eq!(CloneKind::Sleep.type_name(), "Sleep");
    }
}
