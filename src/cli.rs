//! Command-line interface.
//!
//! Thin operational surface over the library: preflight planning, query
//! execution, memory ingestion, one-shot meta-learning cycles and
//! monitoring of adopted configurations.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::memory::{HashingEmbedder, MemoryStore, NewMemoryItem, DEFAULT_EMBEDDING_DIMS};
use crate::meta::{
    BenchmarkCase, ConfigRegistry, Decision, MetaLearningLoop, MonitorOutcome,
    ParameterAllowlist, ProposalStatus, ReplayEvaluator, SandboxEvaluator,
};
use crate::orchestrator::{
    Controller, EchoInvoker, EngineContext, HttpInvoker, PatternGate, Query, QueryStatus,
    ReasoningInvoker,
};
use crate::storage::{SqliteStorage, Storage};
use crate::trace::{read_ndjson, ArtifactWriter};

const RULE: &str =
    "═══════════════════════════════════════════════════════════════════════════════\n";

/// LAG/RCR orchestration engine.
#[derive(Parser, Debug)]
#[command(name = "lag-rcr-engine", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Engine subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Decompose a query and print the preflight plan as JSON
    Plan {
        /// The query text
        query: String,
    },

    /// Execute a query end to end
    Run {
        /// The query text
        query: String,

        /// Use the deterministic offline invoker instead of the HTTP endpoint
        #[arg(long)]
        offline: bool,

        /// Print the full outcome, trace included
        #[arg(long)]
        full: bool,
    },

    /// Load memory items from a JSONL file
    Ingest {
        /// One JSON object per line: {"content", "id"?, "role_tags"?, "created_at"?}
        file: PathBuf,
    },

    /// Run one meta-learning cycle over recorded traces
    Improve {
        /// NDJSON execution trace(s)
        #[arg(long, required = true)]
        traces: Vec<PathBuf>,

        /// JSONL benchmark cases: {"query", "expected": [..]}
        #[arg(long)]
        benchmark: PathBuf,

        /// Replay the benchmark with the offline invoker
        #[arg(long)]
        offline: bool,
    },

    /// Re-measure the active configuration and roll back a regressed adoption
    Monitor {
        /// JSONL benchmark cases: {"query", "expected": [..]}
        #[arg(long)]
        benchmark: PathBuf,

        /// Replay the benchmark with the offline invoker
        #[arg(long)]
        offline: bool,
    },

    /// Show persisted proposals and configuration versions
    History {
        /// Maximum number of proposals to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Reactivate a previous configuration version
    Rollback {
        /// Version to reactivate
        version: u64,
    },
}

/// Result of CLI command execution.
#[derive(Debug)]
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a CLI command.
pub async fn execute_command(
    command: Commands,
    config: &Config,
    storage: &SqliteStorage,
) -> CliResult {
    let result = match command {
        Commands::Plan { query } => execute_plan(config, storage, &query).await,
        Commands::Run {
            query,
            offline,
            full,
        } => execute_run(config, storage, &query, offline, full).await,
        Commands::Ingest { file } => execute_ingest(storage, &file).await,
        Commands::Improve {
            traces,
            benchmark,
            offline,
        } => execute_improve(config, storage, &traces, &benchmark, offline).await,
        Commands::Monitor { benchmark, offline } => {
            execute_monitor(config, storage, &benchmark, offline).await
        }
        Commands::History { limit } => execute_history(storage, limit).await,
        Commands::Rollback { version } => execute_rollback(config, storage, version).await,
    };

    match result {
        Ok(result) => result,
        Err(e) => CliResult::error(format!("Error: {}", e)),
    }
}

async fn execute_plan(
    config: &Config,
    storage: &SqliteStorage,
    query: &str,
) -> EngineResult<CliResult> {
    let ctx = build_context(config, storage, true, false).await?;
    let decomposition = Controller::new(Arc::new(ctx))?.plan(query).await?;
    Ok(CliResult::success(to_pretty(&decomposition)?))
}

async fn execute_run(
    config: &Config,
    storage: &SqliteStorage,
    query: &str,
    offline: bool,
    full: bool,
) -> EngineResult<CliResult> {
    let ctx = build_context(config, storage, offline, config.artifacts.enabled).await?;
    let controller = Controller::new(Arc::new(ctx))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling query");
            on_signal.cancel();
        }
    });

    let outcome = controller.execute(Query::new(query), cancel).await;
    signal_task.abort();
    let outcome = outcome?;

    let message = if full {
        to_pretty(&outcome)?
    } else {
        to_pretty(&json!({
            "run_id": outcome.run_id,
            "correlation_id": outcome.correlation_id,
            "status": outcome.status,
            "answer": outcome.answer,
            "confidence": outcome.confidence,
            "reason": outcome.reason,
            "nodes": outcome.nodes,
            "selected_tokens": outcome.selected_tokens(),
            "steps_used": outcome.steps_used,
            "elapsed_ms": outcome.elapsed_ms,
        }))?
    };

    Ok(match outcome.status {
        QueryStatus::Terminated => CliResult {
            exit_code: 2,
            message,
        },
        QueryStatus::Completed | QueryStatus::Partial => CliResult::success(message),
    })
}

async fn execute_ingest(storage: &SqliteStorage, file: &Path) -> EngineResult<CliResult> {
    let items: Vec<NewMemoryItem> = read_jsonl(file)?;
    let count = items.len();

    let memory = load_memory(storage).await?;
    let version = memory.ingest(items).await?;
    let snapshot = memory.snapshot().await;
    storage.save_memory_items(&snapshot.items, version).await?;

    info!(items = count, version, "Memory items ingested");
    Ok(CliResult::success(format!(
        "Ingested {} item(s); memory is now at version {} with {} item(s), {} tokens",
        count,
        version,
        snapshot.len(),
        snapshot.total_tokens
    )))
}

async fn execute_improve(
    config: &Config,
    storage: &SqliteStorage,
    trace_files: &[PathBuf],
    benchmark: &Path,
    offline: bool,
) -> EngineResult<CliResult> {
    let mut traces = Vec::new();
    for path in trace_files {
        traces.extend(read_ndjson(path)?);
    }
    let cases = read_benchmark(benchmark)?;

    let registry = Arc::new(load_registry(storage, &config.engine).await?);
    let ctx = build_context(config, storage, offline, false)
        .await?
        .with_config(registry.current());
    let evaluator = ReplayEvaluator::new(&ctx, cases, config.meta.sandbox_repeats);

    let meta_loop = restore_loop(config, storage, registry.clone(), Arc::new(evaluator)).await?;
    let cycle = meta_loop.run_cycle(&traces).await;
    storage
        .save_breaker_state(&meta_loop.breaker_snapshot())
        .await?;
    let cycle = cycle?;

    if let Some(proposal) = &cycle.proposal {
        storage
            .save_proposal(proposal, cycle.ab_result.as_ref())
            .await?;
    }
    if cycle.decision == Some(Decision::Adopted) {
        if let Some(active) = registry.active() {
            storage.save_config_version(&active).await?;
            storage.set_active_version(active.version).await?;
        }
    }

    Ok(CliResult::success(to_pretty(&cycle)?))
}

async fn execute_monitor(
    config: &Config,
    storage: &SqliteStorage,
    benchmark: &Path,
    offline: bool,
) -> EngineResult<CliResult> {
    let cases = read_benchmark(benchmark)?;

    let registry = Arc::new(load_registry(storage, &config.engine).await?);
    let ctx = build_context(config, storage, offline, false)
        .await?
        .with_config(registry.current());
    let evaluator = ReplayEvaluator::new(&ctx, cases, config.meta.sandbox_repeats);

    let meta_loop = restore_loop(config, storage, registry, Arc::new(evaluator)).await?;
    let outcome = meta_loop.monitor_active().await?;
    record_monitor_outcome(storage, &outcome).await?;
    storage
        .save_breaker_state(&meta_loop.breaker_snapshot())
        .await?;

    Ok(CliResult::success(to_pretty(&outcome)?))
}

/// Persist a monitoring rollback: the parent becomes active again and the
/// proposal behind the reverted version is marked rolled back.
async fn record_monitor_outcome(
    storage: &SqliteStorage,
    outcome: &MonitorOutcome,
) -> EngineResult<()> {
    let MonitorOutcome::RolledBack {
        from,
        to,
        proposal_id,
        reason,
    } = outcome
    else {
        return Ok(());
    };

    storage.set_active_version(*to).await?;
    if let Some(id) = proposal_id {
        match storage.get_proposal(&id.0).await? {
            Some(mut record) => {
                record.proposal.transition(ProposalStatus::RolledBack)?;
                storage.save_proposal(&record.proposal, None).await?;
            }
            None => warn!(proposal_id = %id, "Rolled back version has no stored proposal"),
        }
    }

    warn!(from, to, reason = %reason, "Adopted configuration rolled back by monitoring");
    Ok(())
}

async fn execute_history(storage: &SqliteStorage, limit: u32) -> EngineResult<CliResult> {
    let mut output = String::new();

    output.push_str("\nConfiguration Versions\n");
    output.push_str(RULE);
    let history = storage.load_config_history().await?;
    if history.versions.is_empty() {
        output.push_str("  (none recorded)\n");
    }
    for version in &history.versions {
        let marker = if history.active == Some(version.version) {
            "*"
        } else {
            " "
        };
        output.push_str(&format!(
            "{} v{:<4} parent={:<6} proposal={} created={}\n",
            marker,
            version.version,
            version
                .parent
                .map(|p| format!("v{}", p))
                .unwrap_or_else(|| "-".to_string()),
            version
                .proposal_id
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            version.created_at.format("%Y-%m-%d %H:%M:%S"),
        ));
    }

    output.push_str("\nProposals\n");
    output.push_str(RULE);
    let proposals = storage.list_proposals(limit).await?;
    if proposals.is_empty() {
        output.push_str("  (none recorded)\n");
    }
    for record in &proposals {
        let proposal = &record.proposal;
        output.push_str(&format!(
            "[{}] {} risk={} {}\n",
            proposal.status, proposal.id, proposal.risk_level.as_str(), proposal.hypothesis
        ));
        if let Some(ab) = &record.ab_result {
            output.push_str(&format!(
                "    accuracy {:.3} -> {:.3}, latency {:.1}ms -> {:.1}ms, tokens {:.1} -> {:.1}\n",
                ab.control.accuracy,
                ab.treatment.accuracy,
                ab.control.mean_latency_ms,
                ab.treatment.mean_latency_ms,
                ab.control.mean_tokens,
                ab.treatment.mean_tokens,
            ));
        }
    }

    Ok(CliResult::success(output))
}

async fn execute_rollback(
    config: &Config,
    storage: &SqliteStorage,
    version: u64,
) -> EngineResult<CliResult> {
    let registry = load_registry(storage, &config.engine).await?;
    let from = registry.current_version();
    registry.rollback_to(version)?;
    storage.set_active_version(version).await?;

    info!(from, to = version, "Configuration rolled back");
    Ok(CliResult::success(format!(
        "Active configuration: v{} (was v{})",
        version, from
    )))
}

/// Memory store seeded from the persisted items.
async fn load_memory(storage: &SqliteStorage) -> EngineResult<MemoryStore> {
    let (version, items) = storage.load_memory_items().await?;
    Ok(MemoryStore::from_items(
        Arc::new(HashingEmbedder::new(DEFAULT_EMBEDDING_DIMS)),
        version,
        items,
    ))
}

/// Registry rebuilt from storage.
///
/// An empty history is seeded with the environment configuration as
/// version 1. When the environment configuration differs from the one seen
/// on the previous start, it is published as a new active version; adopted
/// versions stay active while the environment is unchanged.
async fn load_registry(
    storage: &SqliteStorage,
    initial: &EngineConfig,
) -> EngineResult<ConfigRegistry> {
    let history = storage.load_config_history().await?;
    let Some(latest) = history.versions.last().map(|v| v.version) else {
        let registry = ConfigRegistry::new(initial.clone());
        if let Some(first) = registry.active() {
            storage.save_config_version(&first).await?;
            storage.set_active_version(first.version).await?;
        }
        storage.save_seed_config(initial).await?;
        return Ok(registry);
    };

    // Databases written before the seed was recorded fall back to version 1.
    let previous_seed = match storage.load_seed_config().await? {
        Some(seed) => Some(seed),
        None => history.versions.first().map(|v| (*v.config).clone()),
    };
    let active = history.active.unwrap_or(latest);
    let registry = ConfigRegistry::from_versions(history.versions, active)?;

    if previous_seed.as_ref() != Some(initial) {
        let published = registry.publish(initial.clone())?;
        storage.save_config_version(&published).await?;
        storage.set_active_version(published.version).await?;
        storage.save_seed_config(initial).await?;
        info!(
            version = published.version,
            parent = ?published.parent,
            "Environment configuration changed, published as new version"
        );
    }
    Ok(registry)
}

/// Loop over `registry`, resuming the breaker state saved by the last run.
async fn restore_loop(
    config: &Config,
    storage: &SqliteStorage,
    registry: Arc<ConfigRegistry>,
    evaluator: Arc<dyn SandboxEvaluator>,
) -> EngineResult<MetaLearningLoop> {
    let meta_loop = MetaLearningLoop::new(
        config.meta.clone(),
        ParameterAllowlist::default_engine(),
        registry,
        evaluator,
    );
    Ok(match storage.load_breaker_state().await? {
        Some(saved) => meta_loop.with_breaker_state(saved),
        None => meta_loop,
    })
}

fn read_benchmark(path: &Path) -> EngineResult<Vec<BenchmarkCase>> {
    let cases: Vec<BenchmarkCase> = read_jsonl(path)?;
    if cases.is_empty() {
        return Err(EngineError::config(format!(
            "benchmark file {} contains no cases",
            path.display()
        )));
    }
    Ok(cases)
}

async fn build_context(
    config: &Config,
    storage: &SqliteStorage,
    offline: bool,
    with_artifacts: bool,
) -> EngineResult<EngineContext> {
    let memory = Arc::new(load_memory(storage).await?);
    let registry = load_registry(storage, &config.engine).await?;
    let gate = Arc::new(PatternGate::new()?);

    let invoker: Arc<dyn ReasoningInvoker> = if offline {
        Arc::new(EchoInvoker)
    } else {
        Arc::new(HttpInvoker::new(&config.invoker)?)
    };

    let ctx = EngineContext::new(memory, registry.current(), invoker, gate.clone());
    Ok(if with_artifacts {
        ctx.with_artifacts(ArtifactWriter::new(config.artifacts.dir.clone(), gate))
    } else {
        ctx
    })
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> EngineResult<Vec<T>> {
    let file = File::open(path).map_err(|e| {
        EngineError::config(format!("cannot open {}: {}", path.display(), e))
    })?;

    let mut out = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| {
            EngineError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(&line).map_err(|e| {
            EngineError::config(format!("{}:{}: {}", path.display(), index + 1, e))
        })?;
        out.push(value);
    }
    Ok(out)
}

fn to_pretty<T: serde::Serialize>(value: &T) -> EngineResult<String> {
    serde_json::to_string_pretty(value).map_err(|e| EngineError::Internal {
        message: format!("failed to render output: {}", e),
    })
}
