// =============================================================================
// Pipeline error taxonomy
// =============================================================================
//
// Record-level errors (malformed input, late trades, out-of-order candles) are
// counted and logged by the worker and never abort the stream.  Infrastructure
// errors (log or checkpoint store unavailable, fenced commits) propagate to
// the runner, which retries or restarts the partition worker.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("late trade for {pair}: window ending {window_end_ms} already sealed (watermark {watermark_ms})")]
    LateTrade {
        pair: String,
        window_end_ms: i64,
        watermark_ms: i64,
    },

    #[error("out-of-order candle for {pair}: window_end {window_end_ms} <= buffered tail {tail_end_ms}")]
    OutOfOrderCandle {
        pair: String,
        window_end_ms: i64,
        tail_end_ms: i64,
    },

    #[error("upstream log unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("checkpoint store failure: {0}")]
    Checkpoint(String),

    #[error("commit fenced: {member} no longer owns partition {partition} (generation {generation})")]
    Fenced {
        member: String,
        partition: u32,
        generation: u64,
    },

    #[error("consumer group {group} is already run by another process ({holder})")]
    GroupBusy { group: String, holder: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Errors isolated to one input record.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_) | Self::LateTrade { .. } | Self::OutOfOrderCandle { .. }
        )
    }

    /// Errors worth retrying in place with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }
}
