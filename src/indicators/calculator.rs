// =============================================================================
// Indicator Calculator: candles in, indicator records out
// =============================================================================
//
// One `CandleHistory` per pair.  On each candle:
//   1. Append to the pair's history (out-of-order and duplicate candles are
//      rejected and the buffer is left unchanged).
//   2. Compute every configured indicator whose lookback is met and emit one
//      record, unless none is ready yet.
//
// The buffers themselves are the checkpointed progress (at most `capacity`
// candles per pair), so a resumed calculator never has to replay input and a
// pair that stops trading never holds the commit position back.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::history::CandleHistory;
use super::registry::{history_capacity, IndicatorSpec};
use crate::errors::PipelineError;
use crate::types::{Candle, IndicatorRecord, IndicatorValue};

/// Checkpointed progress: each pair's buffered candles, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorProgress {
    #[serde(default)]
    pub histories: BTreeMap<String, Vec<Candle>>,
}

pub struct IndicatorCalculator {
    specs: Vec<IndicatorSpec>,
    capacity: usize,
    histories: BTreeMap<String, CandleHistory>,
}

impl IndicatorCalculator {
    /// `min_capacity` is a floor on the per-pair buffer size; the buffer always
    /// holds at least the largest lookback.
    pub fn new(specs: Vec<IndicatorSpec>, min_capacity: usize) -> Self {
        let capacity = history_capacity(&specs, min_capacity);
        Self {
            specs,
            capacity,
            histories: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Process one candle.
    pub fn update(&mut self, candle: &Candle) -> Result<Option<IndicatorRecord>, PipelineError> {
        let capacity = self.capacity;
        let history = self
            .histories
            .entry(candle.pair.clone())
            .or_insert_with(|| CandleHistory::new(capacity));
        history.push(candle.clone())?;

        let window = history.as_slice();
        let closes: Vec<f64> = window.iter().map(|c| c.close).collect();

        let indicators: BTreeMap<String, IndicatorValue> = self
            .specs
            .iter()
            .filter_map(|spec| {
                let value = spec.kind.compute(window, &closes)?;
                is_finite(&value).then(|| (spec.name.clone(), value))
            })
            .collect();

        if indicators.is_empty() {
            return Ok(None);
        }

        Ok(Some(IndicatorRecord {
            pair: candle.pair.clone(),
            window_end_ms: candle.window_end_ms,
            indicators,
        }))
    }

    /// Buffered candles for `pair`.
    #[cfg(test)]
    pub fn history_len(&self, pair: &str) -> usize {
        self.histories.get(pair).map_or(0, CandleHistory::len)
    }

    /// All state lives in the progress snapshot, so every processed input is
    /// safe to commit past.
    pub fn safe_position(&self, next_offset: u64) -> u64 {
        next_offset
    }

    pub fn progress(&self) -> IndicatorProgress {
        IndicatorProgress {
            histories: self
                .histories
                .iter()
                .map(|(pair, history)| (pair.clone(), history.snapshot()))
                .collect(),
        }
    }

    /// Reset to checkpointed progress.
    pub fn restore(&mut self, progress: IndicatorProgress) {
        let capacity = self.capacity;
        self.histories = progress
            .histories
            .into_iter()
            .map(|(pair, candles)| (pair, CandleHistory::restored(capacity, candles)))
            .collect();
    }
}

fn is_finite(value: &IndicatorValue) -> bool {
    match value {
        IndicatorValue::Scalar(v) => v.is_finite(),
        IndicatorValue::Multi(parts) => parts.values().all(|v| v.is_finite()),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::registry::parse_set;

    fn calculator(names: &[&str], floor: usize) -> IndicatorCalculator {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        IndicatorCalculator::new(parse_set(&names).unwrap(), floor)
    }

    fn candle(pair: &str, minute: i64, close: f64) -> Candle {
        Candle {
            pair: pair.into(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            trade_count: 3,
            window_start_ms: minute * 60_000,
            window_end_ms: (minute + 1) * 60_000,
            candle_seconds: 60,
        }
    }

    fn sma(record: &IndicatorRecord, name: &str) -> f64 {
        record.indicators[name].as_scalar().unwrap()
    }

    #[test]
    fn sma_ramp_up_and_eviction() {
        // Lookback 3 over closes [10, 20, 30] then [40].
        let mut calc = calculator(&["sma_3"], 0);
        assert_eq!(calc.capacity(), 3);

        assert!(calc.update(&candle("BTC/USD", 0, 10.0)).unwrap().is_none());
        assert!(calc.update(&candle("BTC/USD", 1, 20.0)).unwrap().is_none());
        let third = calc.update(&candle("BTC/USD", 2, 30.0)).unwrap().unwrap();
        assert!((sma(&third, "sma_3") - 20.0).abs() < 1e-10);
        assert_eq!(third.window_end_ms, 3 * 60_000);

        let fourth = calc.update(&candle("BTC/USD", 3, 40.0)).unwrap().unwrap();
        assert!((sma(&fourth, "sma_3") - 30.0).abs() < 1e-10);
        assert_eq!(calc.history_len("BTC/USD"), 3);
    }

    #[test]
    fn partial_records_omit_unready_indicators() {
        let mut calc = calculator(&["sma_2", "sma_4", "bbands_3_2"], 0);
        calc.update(&candle("ETH/USD", 0, 1.0)).unwrap();
        let r = calc.update(&candle("ETH/USD", 1, 2.0)).unwrap().unwrap();
        assert!(r.indicators.contains_key("sma_2"));
        assert!(!r.indicators.contains_key("sma_4"));
        assert!(!r.indicators.contains_key("bbands_3_2"));

        let r = calc.update(&candle("ETH/USD", 2, 3.0)).unwrap().unwrap();
        let bands = &r.indicators["bbands_3_2"];
        assert!((bands.component("middle").unwrap() - 2.0).abs() < 1e-10);
        assert!(!r.indicators.contains_key("sma_4"));
    }

    #[test]
    fn out_of_order_candle_is_rejected() {
        let mut calc = calculator(&["sma_2"], 0);
        calc.update(&candle("BTC/USD", 5, 10.0)).unwrap();
        calc.update(&candle("BTC/USD", 6, 20.0)).unwrap();

        let err = calc.update(&candle("BTC/USD", 6, 99.0)).unwrap_err();
        assert!(matches!(err, PipelineError::OutOfOrderCandle { .. }));
        let err = calc.update(&candle("BTC/USD", 2, 99.0)).unwrap_err();
        assert!(err.is_record_level());

        // Next in-order candle sees the untouched buffer.
        let r = calc.update(&candle("BTC/USD", 7, 30.0)).unwrap().unwrap();
        assert!((sma(&r, "sma_2") - 25.0).abs() < 1e-10);
    }

    #[test]
    fn pairs_are_independent() {
        let mut calc = calculator(&["sma_2"], 0);
        calc.update(&candle("BTC/USD", 0, 10.0)).unwrap();
        assert!(calc.update(&candle("ETH/USD", 0, 100.0)).unwrap().is_none());
        let r = calc.update(&candle("BTC/USD", 1, 20.0)).unwrap().unwrap();
        assert_eq!(r.pair, "BTC/USD");
        assert!((sma(&r, "sma_2") - 15.0).abs() < 1e-10);
    }

    #[test]
    fn buffer_never_exceeds_capacity() {
        let mut calc = calculator(&["sma_3", "rsi_14"], 20);
        assert_eq!(calc.capacity(), 20);
        for i in 0..100 {
            calc.update(&candle("SOL/USD", i, 10.0 + (i % 7) as f64)).unwrap();
            assert!(calc.history_len("SOL/USD") <= 20);
        }
    }

    #[test]
    fn default_indicator_set_fills_in() {
        let names = crate::runtime_config::PipelineConfig::default().indicators;
        let mut calc = IndicatorCalculator::new(parse_set(&names).unwrap(), 70);
        let mut last = None;
        for i in 0..80 {
            let close = 100.0 + (i as f64 * 0.3).sin() * 5.0;
            if let Some(r) = calc.update(&candle("BTC/USD", i, close)).unwrap() {
                last = Some(r);
            }
        }
        let last = last.unwrap();
        assert_eq!(last.indicators.len(), names.len());
        let rsi = last.indicators["rsi_14"].as_scalar().unwrap();
        assert!((0.0..=100.0).contains(&rsi));
        assert!(last.indicators["macd_12_26_9"].component("histogram").is_some());
    }

    #[test]
    fn restore_continues_from_snapshot() {
        let candles: Vec<Candle> = (0..12).map(|i| candle("BTC/USD", i, 10.0 + i as f64)).collect();

        let mut reference = calculator(&["sma_3", "ema_3"], 0);
        let expected: Vec<IndicatorRecord> =
            candles.iter().filter_map(|c| reference.update(c).unwrap()).collect();

        let mut first = calculator(&["sma_3", "ema_3"], 0);
        let mut emitted: Vec<IndicatorRecord> =
            candles[..8].iter().filter_map(|c| first.update(c).unwrap()).collect();
        assert_eq!(first.safe_position(8), 8);

        // The snapshot survives a JSON round trip through the checkpoint.
        let saved = serde_json::to_value(first.progress()).unwrap();
        let mut resumed = calculator(&["sma_3", "ema_3"], 0);
        resumed.restore(serde_json::from_value(saved).unwrap());
        assert_eq!(resumed.history_len("BTC/USD"), 3);

        emitted.extend(candles[8..].iter().filter_map(|c| resumed.update(c).unwrap()));
        assert_eq!(emitted, expected);

        // A candle already in the snapshot is a duplicate, not a new record.
        let mut again = calculator(&["sma_3", "ema_3"], 0);
        again.restore(first.progress());
        assert!(again.update(&candles[7]).unwrap_err().is_record_level());
    }

    #[test]
    fn quiet_pair_does_not_hold_back_commit_position() {
        let mut calc = calculator(&["sma_2"], 0);
        calc.update(&candle("DELISTED/USD", 0, 1.0)).unwrap();
        for i in 1..1_000 {
            calc.update(&candle("BTC/USD", i, 10.0)).unwrap();
        }
        assert_eq!(calc.safe_position(1_000), 1_000);

        let mut resumed = calculator(&["sma_2"], 0);
        resumed.restore(calc.progress());
        assert_eq!(resumed.history_len("DELISTED/USD"), 1);
        let r = resumed.update(&candle("DELISTED/USD", 5, 3.0)).unwrap().unwrap();
        assert!((sma(&r, "sma_2") - 2.0).abs() < 1e-10);
    }
}
