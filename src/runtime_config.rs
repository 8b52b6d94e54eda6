// =============================================================================
// Pipeline Configuration: JSON file + environment overrides
// =============================================================================
//
// Every tunable of both stages lives here.  All fields carry
// `#[serde(default)]` so a minimal deployment needs nothing but an empty file
// (or no file at all); environment variables are applied on top so container
// deployments can override single values.
//
// Historical (backfill) mode suffixes every topic and the consumer group with
// `_historical`.  Checkpoints are namespaced by consumer group, so a backfill
// never reads or writes live progress.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregator::IdlePolicy;
use crate::errors::PipelineError;
use crate::types::RunMode;

const HISTORICAL_SUFFIX: &str = "_historical";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_log_dir() -> PathBuf {
    PathBuf::from("./data/log")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./data/checkpoints")
}

fn default_trades_topic() -> String {
    "trades".to_string()
}

fn default_candles_topic() -> String {
    "candles".to_string()
}

fn default_indicators_topic() -> String {
    "technical_indicators".to_string()
}

fn default_partitions() -> u32 {
    4
}

fn default_window_seconds() -> u64 {
    60
}

fn default_lateness_ms() -> i64 {
    5_000
}

fn default_indicators() -> Vec<String> {
    [
        "sma_7",
        "sma_14",
        "sma_21",
        "ema_14",
        "rsi_14",
        "macd_12_26_9",
        "bbands_20_2",
        "atr_14",
        "roc_10",
        "obv",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_candles_in_state() -> usize {
    70
}

fn default_commit_interval_ms() -> u64 {
    5_000
}

fn default_commit_every_records() -> u64 {
    1_000
}

fn default_poll_batch_size() -> usize {
    500
}

fn default_poll_idle_ms() -> u64 {
    100
}

fn default_restart_delay_ms() -> u64 {
    5_000
}

fn default_max_backoff_secs() -> u64 {
    60
}

// =============================================================================
// Stage selection
// =============================================================================

/// Which of the two chained stages a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Candles,
    Indicators,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Candles => write!(f, "candles"),
            Self::Indicators => write!(f, "indicators"),
        }
    }
}

impl std::str::FromStr for StageKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "candles" => Ok(Self::Candles),
            "indicators" | "technical_indicators" => Ok(Self::Indicators),
            other => Err(PipelineError::Config(format!("unknown stage {other}"))),
        }
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration for one pipeline process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    // --- Deployment ----------------------------------------------------------

    /// `live` or `historical` (isolated backfill).
    #[serde(default)]
    pub mode: RunMode,

    /// Root directory of the partitioned log ("broker address").
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Root directory of the checkpoint store.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Partition count used when a topic is created.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    // --- Topics --------------------------------------------------------------

    #[serde(default = "default_trades_topic")]
    pub trades_topic: String,

    #[serde(default = "default_candles_topic")]
    pub candles_topic: String,

    #[serde(default = "default_indicators_topic")]
    pub indicators_topic: String,

    /// Explicit input topic; otherwise derived from the stage.
    #[serde(default)]
    pub input_topic: Option<String>,

    /// Explicit output topic; otherwise derived from the stage.
    #[serde(default)]
    pub output_topic: Option<String>,

    /// Explicit consumer group; otherwise `<stage>-<input topic>`.
    #[serde(default)]
    pub consumer_group: Option<String>,

    // --- Candle aggregation --------------------------------------------------

    /// Tumbling window width in seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Bounded-lateness tolerance `L` in milliseconds.
    #[serde(default = "default_lateness_ms")]
    pub lateness_ms: i64,

    /// Forced watermark advancement for quiet pairs.
    #[serde(default)]
    pub idle_policy: IdlePolicy,

    /// Emit flat zero-volume candles for windows without trades.
    #[serde(default)]
    pub fill_gaps: bool,

    // --- Indicators ----------------------------------------------------------

    /// Indicator names, e.g. `sma_14`, `macd_12_26_9`, `bbands_20_2`.
    #[serde(default = "default_indicators")]
    pub indicators: Vec<String>,

    /// Lower bound on the per-pair history capacity; the effective capacity is
    /// the max of this and the largest indicator lookback.
    #[serde(default = "default_max_candles_in_state")]
    pub max_candles_in_state: usize,

    // --- Worker cadence ------------------------------------------------------

    /// Commit a checkpoint at least this often.
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,

    /// ... or after this many input records, whichever comes first.
    #[serde(default = "default_commit_every_records")]
    pub commit_every_records: u64,

    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,

    /// Sleep between polls of an exhausted partition.
    #[serde(default = "default_poll_idle_ms")]
    pub poll_idle_ms: u64,

    /// Delay before a failed partition worker is restarted.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Ceiling of the upstream retry backoff.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Live,
            log_dir: default_log_dir(),
            checkpoint_dir: default_checkpoint_dir(),
            partitions: default_partitions(),
            trades_topic: default_trades_topic(),
            candles_topic: default_candles_topic(),
            indicators_topic: default_indicators_topic(),
            input_topic: None,
            output_topic: None,
            consumer_group: None,
            window_seconds: default_window_seconds(),
            lateness_ms: default_lateness_ms(),
            idle_policy: IdlePolicy::default(),
            fill_gaps: false,
            indicators: default_indicators(),
            max_candles_in_state: default_max_candles_in_state(),
            commit_interval_ms: default_commit_interval_ms(),
            commit_every_records: default_commit_every_records(),
            poll_batch_size: default_poll_batch_size(),
            poll_idle_ms: default_poll_idle_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            window_seconds = config.window_seconds,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Apply `PIPELINE_*` overrides.  `lookup` is `std::env::var(..).ok()` in
    /// production and a map in tests.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PIPELINE_MODE") {
            self.mode = v.parse()?;
        }
        if let Some(v) = lookup("PIPELINE_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PIPELINE_CHECKPOINT_DIR") {
            self.checkpoint_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PIPELINE_INPUT_TOPIC") {
            self.input_topic = Some(v);
        }
        if let Some(v) = lookup("PIPELINE_OUTPUT_TOPIC") {
            self.output_topic = Some(v);
        }
        if let Some(v) = lookup("PIPELINE_CONSUMER_GROUP") {
            self.consumer_group = Some(v);
        }
        if let Some(v) = lookup("PIPELINE_PARTITIONS") {
            self.partitions = v.parse().context("PIPELINE_PARTITIONS must be an integer")?;
        }
        if let Some(v) = lookup("PIPELINE_WINDOW_SECONDS") {
            self.window_seconds = v.parse().context("PIPELINE_WINDOW_SECONDS must be an integer")?;
        }
        if let Some(v) = lookup("PIPELINE_LATENESS_MS") {
            self.lateness_ms = v.parse().context("PIPELINE_LATENESS_MS must be an integer")?;
        }
        if let Some(v) = lookup("PIPELINE_IDLE_TIMEOUT_MS") {
            let timeout_ms: i64 = v.parse().context("PIPELINE_IDLE_TIMEOUT_MS must be an integer")?;
            self.idle_policy = self.idle_policy.with_timeout(timeout_ms);
        }
        if let Some(v) = lookup("PIPELINE_COMMIT_INTERVAL_MS") {
            self.commit_interval_ms =
                v.parse().context("PIPELINE_COMMIT_INTERVAL_MS must be an integer")?;
        }
        if let Some(v) = lookup("PIPELINE_INDICATORS") {
            self.indicators = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(())
    }

    /// Reject configurations the stages cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.window_seconds == 0 {
            return Err(PipelineError::Config("window_seconds must be > 0".into()));
        }
        if self.lateness_ms < 0 {
            return Err(PipelineError::Config("lateness_ms must be >= 0".into()));
        }
        if self.partitions == 0 {
            return Err(PipelineError::Config("partitions must be > 0".into()));
        }
        if self.commit_interval_ms == 0 || self.commit_every_records == 0 {
            return Err(PipelineError::Config("commit cadence must be > 0".into()));
        }
        if self.poll_batch_size == 0 {
            return Err(PipelineError::Config("poll_batch_size must be > 0".into()));
        }
        match self.idle_policy {
            IdlePolicy::EventTime { timeout_ms } | IdlePolicy::ProcessingTime { timeout_ms }
                if timeout_ms <= 0 =>
            {
                return Err(PipelineError::Config(format!(
                    "idle_policy.timeout_ms must be > 0 (got {timeout_ms}); use kind \"disabled\" to turn idle sealing off"
                )));
            }
            _ => {}
        }
        crate::indicators::registry::parse_set(&self.indicators)?;
        Ok(())
    }

    pub fn window_ms(&self) -> i64 {
        (self.window_seconds * 1_000) as i64
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn input_topic(&self, stage: StageKind) -> String {
        let base = self.input_topic.clone().unwrap_or_else(|| match stage {
            StageKind::Candles => self.trades_topic.clone(),
            StageKind::Indicators => self.candles_topic.clone(),
        });
        self.scoped(base)
    }

    pub fn output_topic(&self, stage: StageKind) -> String {
        let base = self.output_topic.clone().unwrap_or_else(|| match stage {
            StageKind::Candles => self.candles_topic.clone(),
            StageKind::Indicators => self.indicators_topic.clone(),
        });
        self.scoped(base)
    }

    pub fn consumer_group(&self, stage: StageKind) -> String {
        let base = self.consumer_group.clone().unwrap_or_else(|| {
            let input = self.input_topic.clone().unwrap_or_else(|| match stage {
                StageKind::Candles => self.trades_topic.clone(),
                StageKind::Indicators => self.candles_topic.clone(),
            });
            format!("{stage}-{input}")
        });
        self.scoped(base)
    }

    fn scoped(&self, name: String) -> String {
        match self.mode {
            RunMode::Historical if !name.ends_with(HISTORICAL_SUFFIX) => {
                format!("{name}{HISTORICAL_SUFFIX}")
            }
            _ => name,
        }
    }
}
