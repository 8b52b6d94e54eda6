use std::collections::VecDeque;

use crate::errors::PipelineError;
use crate::types::Candle;

// ---------------------------------------------------------------------------
// CandleHistory -- bounded ring buffer of sealed candles for one pair
// ---------------------------------------------------------------------------

/// Ring buffer holding the most recent `capacity` candles of one pair, ordered
/// by strictly increasing `window_end_ms`.
#[derive(Debug, Clone)]
pub struct CandleHistory {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl CandleHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            candles: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Rebuild from a checkpointed snapshot.  Candles that do not extend the
    /// tail are dropped; only the newest `capacity` are kept.
    pub fn restored(capacity: usize, candles: Vec<Candle>) -> Self {
        let mut history = Self::new(capacity);
        for candle in candles {
            let _ = history.push(candle);
        }
        history
    }

    /// Append a candle.  A candle that does not extend the tail is rejected
    /// and the buffer is left as it was.
    pub fn push(&mut self, candle: Candle) -> Result<(), PipelineError> {
        if let Some(tail_end_ms) = self.tail_end_ms() {
            if candle.window_end_ms <= tail_end_ms {
                return Err(PipelineError::OutOfOrderCandle {
                    pair: candle.pair,
                    window_end_ms: candle.window_end_ms,
                    tail_end_ms,
                });
            }
        }
        self.candles.push_back(candle);
        // Evict the oldest past capacity.
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
        Ok(())
    }

    /// Buffered candles, oldest first.
    pub fn as_slice(&mut self) -> &[Candle] {
        self.candles.make_contiguous()
    }

    /// Owned copy of the buffer, oldest first.
    pub fn snapshot(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    fn tail_end_ms(&self) -> Option<i64> {
        self.candles.back().map(|c| c.window_end_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(end_min: i64, close: f64) -> Candle {
        Candle {
            pair: "BTC/USD".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            trade_count: 1,
            window_start_ms: (end_min - 1) * 60_000,
            window_end_ms: end_min * 60_000,
            candle_seconds: 60,
        }
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut h = CandleHistory::new(3);
        for i in 1..=5 {
            h.push(candle(i, i as f64)).unwrap();
        }
        assert_eq!(h.len(), 3);
        let closes: Vec<f64> = h.as_slice().iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn rejects_duplicate_and_out_of_order() {
        let mut h = CandleHistory::new(10);
        h.push(candle(2, 1.0)).unwrap();

        let dup = h.push(candle(2, 9.0)).unwrap_err();
        assert!(matches!(dup, PipelineError::OutOfOrderCandle { .. }));
        let older = h.push(candle(1, 9.0)).unwrap_err();
        assert!(older.is_record_level());

        // Buffer untouched.
        assert_eq!(h.len(), 1);
        assert_eq!(h.tail_end_ms(), Some(120_000));
        assert!((h.as_slice()[0].close - 1.0).abs() < 1e-10);
    }

    #[test]
    fn restore_keeps_newest_in_order() {
        let snapshot = vec![candle(1, 1.0), candle(3, 3.0), candle(2, 2.0), candle(4, 4.0), candle(5, 5.0)];
        let mut h = CandleHistory::restored(2, snapshot);
        let ends: Vec<i64> = h.as_slice().iter().map(|c| c.window_end_ms).collect();
        assert_eq!(ends, vec![240_000, 300_000]);
        assert_eq!(h.snapshot().len(), 2);
    }
}
