// =============================================================================
// OHLCV Pipeline: trades → candles → technical indicators
// =============================================================================
//
// One process runs one stage, selected by PIPELINE_STAGE:
//
//   candles     trades topic  → CandleAggregator    → candles topic
//   indicators  candles topic → IndicatorCalculator → technical_indicators topic
//
// Topics live in a directory-backed partitioned log (one JSONL file per
// partition); checkpoints are JSON files namespaced by consumer group.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod coordinator;
mod errors;
mod indicators;
mod log;
mod metrics;
mod pipeline;
mod runtime_config;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::{AggregatorConfig, CandleAggregator};
use crate::coordinator::{Coordinator, FileCheckpointStore, GroupCoordinator, GroupLock};
use crate::indicators::{parse_set, IndicatorCalculator};
use crate::log::{FileLog, PartitionedLog};
use crate::metrics::StageMetrics;
use crate::pipeline::{Runner, WorkerSettings};
use crate::runtime_config::{PipelineConfig, StageKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("PIPELINE_CONFIG").unwrap_or_else(|_| "pipeline_config.json".to_string());
    let mut config = PipelineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        PipelineConfig::default()
    });
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;

    let stage: StageKind = std::env::var("PIPELINE_STAGE")
        .unwrap_or_else(|_| "candles".to_string())
        .parse()?;

    info!(
        stage = %stage,
        mode = %config.mode,
        input = %config.input_topic(stage),
        output = %config.output_topic(stage),
        group = %config.consumer_group(stage),
        "OHLCV pipeline starting"
    );

    // ── 2. Log, group membership, checkpoints ────────────────────────────
    let log: Arc<dyn PartitionedLog> = Arc::new(FileLog::new(&config.log_dir));
    let input_topic = config.input_topic(stage);
    log.create_topic(&input_topic, config.partitions)?;
    let partitions = log
        .partition_count(&input_topic)
        .with_context(|| format!("cannot read partitions of {input_topic}"))?;
    if partitions != config.partitions {
        warn!(
            topic = %input_topic,
            existing = partitions,
            configured = config.partitions,
            "topic already exists with a different partition count; using existing"
        );
    }

    // Held until exit: a second process for the same group refuses to start.
    let _group_lock = GroupLock::acquire(&config.checkpoint_dir, &config.consumer_group(stage))?;
    let group = Arc::new(GroupCoordinator::new(config.consumer_group(stage), partitions));
    let store = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
    let coordinator = Coordinator::new(group, store);
    let metrics = Arc::new(StageMetrics::new());
    let settings = Arc::new(WorkerSettings::from_config(&config, stage));

    // ── 3. Graceful shutdown ─────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received; flushing and committing");
            shutdown_tx.send_replace(true);
        }
    });

    // ── 4. Run the selected stage ────────────────────────────────────────
    let snapshot = match stage {
        StageKind::Candles => {
            let aggregator_config = AggregatorConfig::from(&config);
            Runner::new(
                move || CandleAggregator::new(aggregator_config),
                coordinator,
                log,
                metrics,
                settings,
            )
            .run(shutdown_rx)
            .await?
        }
        StageKind::Indicators => {
            let specs = parse_set(&config.indicators)?;
            let floor = config.max_candles_in_state;
            Runner::new(
                move || IndicatorCalculator::new(specs.clone(), floor),
                coordinator,
                log,
                metrics,
                settings,
            )
            .run(shutdown_rx)
            .await?
        }
    };

    info!(stage = %stage, metrics = ?snapshot, "OHLCV pipeline shut down complete.");
    Ok(())
}
