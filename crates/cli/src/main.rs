//! Orca CLI - lease recovery and capability routing for agent tasks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orca_core::config::{StorageBackend, StorageConfig};
use orca_core::{
    Clock, OrcaConfig, RequestContext, RouteState, SystemClock, TaskId, TaskNode, TaskSubmission,
    WorkFilter,
};
use orca_execution::GraphBuilder;
use orca_lock::LockManager;
use orca_recovery::RecoverySweep;
use orca_routing::{Router, StaticRegistry};
use orca_storage::{JsonStorage, MemoryStorage, Storage};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orca")]
#[command(about = "Lease recovery and capability routing for agent tasks", long_about = None)]
struct Cli {
    /// Config file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reclaim expired leases and requeue or escalate their work
    Sweep {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Route a task against a set of instances
    Route {
        /// Task submission (JSON file)
        #[arg(long)]
        task: PathBuf,
        /// Instance descriptors (JSON array file)
        #[arg(long)]
        instances: PathBuf,
    },
    /// Show decisions and reroutes for a task
    History {
        /// Task ID
        id: String,
    },
    /// Check a task graph and print its execution order
    Plan {
        /// Graph file: a JSON array of nodes with their dependencies
        graph: PathBuf,
    },
    /// List lease records
    Locks,
    /// List work items
    Work {
        /// Only escalated items
        #[arg(long)]
        escalated: bool,
    },
    /// Show the audit trail
    Audit {
        /// Most recent N events
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

/// One entry of a graph file.
#[derive(Deserialize)]
struct GraphEntry {
    #[serde(flatten)]
    node: TaskNode,
    #[serde(default)]
    depends_on: Vec<TaskId>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => OrcaConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => OrcaConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let storage = open_storage(&config.storage).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ctx = RequestContext::system();

    match cli.command {
        Commands::Sweep { once } => {
            let locks = LockManager::new(storage.clone(), clock).with_config(config.lock.clone());
            let sweep = RecoverySweep::new(storage, locks).with_config(&config.recovery);

            if once {
                let report = sweep.run_once(&ctx).await?;
                println!("Sweep {}", ctx.correlation_id);
                println!("  Scanned: {}", report.stats.scanned_count);
                println!("  Expired: {}", report.stats.expired_count);
                println!("  Recovered: {}", report.stats.recovered_count);
                println!("  Skipped: {}", report.stats.skipped_count);
                println!("  Orphaned: {}", report.stats.orphaned_count);
                for task_id in &report.requeued {
                    println!("  requeued  {}", task_id);
                }
                for task_id in &report.escalated {
                    println!("  escalated {}", task_id);
                }
                for error in &report.stats.errors {
                    println!("  error     {}", error);
                }
            } else {
                let cancel = CancellationToken::new();
                let on_signal = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        on_signal.cancel();
                    }
                });
                sweep.run(cancel).await;
            }
        }
        Commands::Route { task, instances } => {
            let raw = std::fs::read_to_string(&task).with_context(|| format!("reading {}", task.display()))?;
            let submission: TaskSubmission = serde_json::from_str(&raw)?;
            let registry = Arc::new(StaticRegistry::from_json_file(&instances)?);
            let router = Router::new(storage, registry, clock).with_config(&config.routing);

            let decision = router.route(&ctx, &submission).await?;
            println!("Task {} -> {}", decision.task_id, decision.selected_instance_id);
            println!("  Score: {:.3}", decision.score);
            println!("  Decision: {}", decision.decision_id);
            for line in &decision.rationale {
                println!("  {}", line);
            }
            for evidence in &decision.evidence_refs {
                println!("  evidence: {}", evidence);
            }
        }
        Commands::History { id } => {
            let task_id: TaskId = id.parse().map_err(|_| anyhow::anyhow!("Invalid task ID"))?;
            let decisions = storage.list_decisions(task_id).await?;
            if decisions.is_empty() {
                println!("No decisions for {}", task_id);
                return Ok(());
            }
            for decision in &decisions {
                println!(
                    "{} | {} | {:.3} | {}",
                    decision.decided_at, decision.decision_id, decision.score, decision.selected_instance_id
                );
            }
            for reroute in storage.list_reroutes(task_id).await? {
                println!(
                    "{} | rerouted {} -> {} ({})",
                    reroute.occurred_at, reroute.previous_instance_id, reroute.new_instance_id, reroute.reason
                );
            }
        }
        Commands::Plan { graph } => {
            let raw = std::fs::read_to_string(&graph).with_context(|| format!("reading {}", graph.display()))?;
            let entries: Vec<GraphEntry> = serde_json::from_str(&raw)?;

            let mut builder = GraphBuilder::new();
            for entry in &entries {
                builder.add_node(entry.node.clone(), &[])?;
            }
            for entry in &entries {
                for dep in &entry.depends_on {
                    builder.add_dependency(*dep, entry.node.task_id)?;
                }
            }
            let graph = builder.build()?;

            println!("Execution order ({})", graph.len());
            for (i, task_id) in graph.topological_order().into_iter().enumerate() {
                if let Some(node) = graph.node(task_id) {
                    println!("  {:>3}. {} | {} | {}", i + 1, task_id, node.node_type, node.title);
                }
            }
        }
        Commands::Locks => {
            let now = SystemClock.now();
            let records = storage.list_locks().await?;
            println!("Leases ({})", records.len());
            for record in records {
                match &record.current {
                    Some(token) if token.is_expired_at(now) => println!(
                        "  {} | EXPIRED | {} | task {} | since {}",
                        record.resource_key, token.holder, token.task_id, token.expires_at
                    ),
                    Some(token) => println!(
                        "  {} | HELD    | {} | task {} | until {}",
                        record.resource_key, token.holder, token.task_id, token.expires_at
                    ),
                    None => println!("  {} | FREE    | v{}", record.resource_key, record.version),
                }
            }
        }
        Commands::Work { escalated } => {
            let filter = WorkFilter {
                escalated: escalated.then_some(true),
                ..Default::default()
            };
            let items = storage.list_work_items(&filter).await?;
            println!("Work items ({})", items.len());
            for item in items {
                let flag = if item.escalated { " [escalated]" } else { "" };
                println!(
                    "  {} | {} | attempts {} | {}{}",
                    item.task_id,
                    item.state,
                    item.attempts,
                    item.instance_id.as_deref().unwrap_or("-"),
                    flag
                );
                if let Some(note) = item.note.as_deref().filter(|_| item.state != RouteState::Completed) {
                    println!("      {}", note);
                }
            }
        }
        Commands::Audit { limit } => {
            let events = storage.list_audit().await?;
            let skip = events.len().saturating_sub(limit);
            for event in events.into_iter().skip(skip) {
                println!(
                    "{} | {} | {} | {} | {}",
                    event.timestamp,
                    event.event_type.as_str(),
                    event.actor,
                    event.subject,
                    event.reason
                );
            }
        }
    }

    info!(correlation_id = %ctx.correlation_id, "done");
    Ok(())
}

async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackend::Json => Ok(Arc::new(JsonStorage::new(&config.path).await?)),
        StorageBackend::Sqlite => open_sqlite(&config.path).await,
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(path: &Path) -> Result<Arc<dyn Storage>> {
    Ok(Arc::new(orca_storage::SqliteStorage::new_from_path(path).await?))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(path: &Path) -> Result<Arc<dyn Storage>> {
    anyhow::bail!("{} is a sqlite store but orca was built without the sqlite feature", path.display())
}
