// =============================================================================
// Stage: what a partition worker runs
// =============================================================================
//
// A stage decodes input records, folds them into per-pair state and returns
// the outputs that became final.  It also reports how far back the input must
// be replayed to rebuild its state (`safe_position`) and the small progress
// snapshot stored alongside each checkpoint.
// =============================================================================

use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::aggregator::{AggregatorProgress, CandleAggregator};
use crate::errors::PipelineError;
use crate::indicators::{IndicatorCalculator, IndicatorProgress};
use crate::metrics::StageMetrics;
use crate::types::{Candle, IndicatorRecord, TradeEvent};

pub trait Stage: Send + 'static {
    type Output: Serialize + Send;
    type Progress: Serialize + DeserializeOwned + Default + Send;

    /// Decode and process one input record read from `offset`.
    fn process(&mut self, payload: &[u8], offset: u64) -> Result<Vec<Self::Output>, PipelineError>;

    /// Outputs released without new input (idle advancement).
    fn on_idle(&mut self, now: Instant) -> Vec<Self::Output>;

    /// Outputs released at the end of a bounded input.
    fn finish(&mut self) -> Vec<Self::Output>;

    /// Partitioning key of an output record.
    fn output_key(output: &Self::Output) -> &str;

    fn record_output(metrics: &StageMetrics, output: &Self::Output);

    /// Smallest input offset still needed to rebuild in-memory state.
    fn safe_position(&self, next_offset: u64) -> u64;

    fn progress(&self) -> Self::Progress;

    fn restore(&mut self, progress: Self::Progress);
}

// ---------------------------------------------------------------------------
// trades -> candles
// ---------------------------------------------------------------------------

impl Stage for CandleAggregator {
    type Output = Candle;
    type Progress = AggregatorProgress;

    fn process(&mut self, payload: &[u8], offset: u64) -> Result<Vec<Candle>, PipelineError> {
        let trade = TradeEvent::from_json(payload)?;
        Ok(self.fold(&trade, offset)?.candles)
    }

    fn on_idle(&mut self, now: Instant) -> Vec<Candle> {
        self.advance_idle(now)
    }

    fn finish(&mut self) -> Vec<Candle> {
        self.drain()
    }

    fn output_key(output: &Candle) -> &str {
        &output.pair
    }

    fn record_output(metrics: &StageMetrics, output: &Candle) {
        metrics.candle_emitted(output.is_gap_fill());
    }

    fn safe_position(&self, next_offset: u64) -> u64 {
        CandleAggregator::safe_position(self, next_offset)
    }

    fn progress(&self) -> AggregatorProgress {
        CandleAggregator::progress(self)
    }

    fn restore(&mut self, progress: AggregatorProgress) {
        CandleAggregator::restore(self, progress)
    }
}

// ---------------------------------------------------------------------------
// candles -> technical indicators
// ---------------------------------------------------------------------------

impl Stage for IndicatorCalculator {
    type Output = IndicatorRecord;
    type Progress = IndicatorProgress;

    fn process(&mut self, payload: &[u8], _offset: u64) -> Result<Vec<IndicatorRecord>, PipelineError> {
        let candle: Candle = serde_json::from_slice(payload)
            .map_err(|e| PipelineError::Malformed(format!("invalid candle: {e}")))?;
        Ok(self.update(&candle)?.into_iter().collect())
    }

    fn on_idle(&mut self, _now: Instant) -> Vec<IndicatorRecord> {
        Vec::new()
    }

    fn finish(&mut self) -> Vec<IndicatorRecord> {
        Vec::new()
    }

    fn output_key(output: &IndicatorRecord) -> &str {
        &output.pair
    }

    fn record_output(metrics: &StageMetrics, _output: &IndicatorRecord) {
        metrics.indicator_record();
    }

    fn safe_position(&self, next_offset: u64) -> u64 {
        IndicatorCalculator::safe_position(self, next_offset)
    }

    fn progress(&self) -> IndicatorProgress {
        IndicatorCalculator::progress(self)
    }

    fn restore(&mut self, progress: IndicatorProgress) {
        IndicatorCalculator::restore(self, progress)
    }
}

/// Count a record-level error against the matching metric.
pub fn record_rejection(metrics: &StageMetrics, err: &PipelineError) {
    match err {
        PipelineError::Malformed(_) => metrics.malformed(),
        PipelineError::LateTrade { .. } => metrics.late_trade(),
        PipelineError::OutOfOrderCandle { .. } => metrics.candle_rejected(),
        _ => {}
    }
}
