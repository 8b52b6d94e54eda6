// =============================================================================
// Tumbling windows and in-progress candle state
// =============================================================================
//
// window_start = floor(timestamp / window) * window
//
// `open` and `close` follow event time, not arrival order.  Two trades with the
// same event time are ordered by arrival: the earlier arrival keeps `open`,
// the later arrival takes `close`.
// =============================================================================

use crate::types::{Candle, TradeEvent};

/// `[start, end)` of the window containing `timestamp_ms`.  Floors towards
/// negative infinity so pre-epoch timestamps still land in aligned buckets.
/// `None` when the window does not fit in `i64` milliseconds.
pub fn window_bounds(timestamp_ms: i64, window_ms: i64) -> Option<(i64, i64)> {
    let start = timestamp_ms.div_euclid(window_ms).checked_mul(window_ms)?;
    Some((start, start.checked_add(window_ms)?))
}

/// Identifies one candle, open or sealed.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct WindowKey {
    pub pair: String,
    pub window_start_ms: i64,
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pair, self.window_start_ms)
    }
}

/// Mutable OHLCV aggregate for one open window.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleState {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    /// Event time of the trade currently providing `open`.
    open_ts: i64,
    /// Event time of the trade currently providing `close`.
    close_ts: i64,
    /// Log offset of the first trade folded in; replay must start at or
    /// before it to rebuild this window.
    first_offset: u64,
}

impl CandleState {
    /// Seed the window `(start, end)` from its first trade.
    pub fn seed(trade: &TradeEvent, (start, end): (i64, i64), offset: u64) -> Self {
        Self {
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.volume,
            trade_count: 1,
            window_start_ms: start,
            window_end_ms: end,
            open_ts: trade.timestamp,
            close_ts: trade.timestamp,
            first_offset: offset,
        }
    }

    /// Fold another trade of the same window into the aggregate.
    pub fn fold(&mut self, trade: &TradeEvent, offset: u64) {
        debug_assert!(trade.timestamp >= self.window_start_ms && trade.timestamp < self.window_end_ms);

        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        if trade.timestamp < self.open_ts {
            self.open = trade.price;
            self.open_ts = trade.timestamp;
        }
        if trade.timestamp >= self.close_ts {
            self.close = trade.price;
            self.close_ts = trade.timestamp;
        }
        self.volume += trade.volume;
        self.trade_count += 1;
        self.first_offset = self.first_offset.min(offset);
    }

    pub fn first_offset(&self) -> u64 {
        self.first_offset
    }

    /// Freeze into an immutable candle.
    pub fn seal(self, pair: &str, candle_seconds: u64) -> Candle {
        Candle {
            pair: pair.to_string(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            trade_count: self.trade_count,
            window_start_ms: self.window_start_ms,
            window_end_ms: self.window_end_ms,
            candle_seconds,
        }
    }
}

/// Flat candle for a window in which no trade happened.
pub fn gap_candle(pair: &str, window_start_ms: i64, window_ms: i64, prev_close: f64) -> Candle {
    Candle {
        pair: pair.to_string(),
        open: prev_close,
        high: prev_close,
        low: prev_close,
        close: prev_close,
        volume: 0.0,
        trade_count: 0,
        window_start_ms,
        window_end_ms: window_start_ms + window_ms,
        candle_seconds: (window_ms / 1_000) as u64,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts: i64, price: f64, volume: f64) -> TradeEvent {
        TradeEvent::new("BTC/USD", price, volume, ts)
    }

    fn minute(ts: i64) -> (i64, i64) {
        window_bounds(ts, 60_000).unwrap()
    }

    #[test]
    fn window_alignment() {
        assert_eq!(minute(0), (0, 60_000));
        assert_eq!(minute(59_999), (0, 60_000));
        assert_eq!(minute(60_000), (60_000, 120_000));
        assert_eq!(minute(1_700_000_012_345).0, 1_699_999_980_000);
        assert_eq!(minute(-1), (-60_000, 0));
    }

    #[test]
    fn window_outside_i64_has_no_bounds() {
        assert_eq!(window_bounds(i64::MAX, 60_000), None);
        assert_eq!(window_bounds(i64::MIN, 60_000), None);
        assert_eq!(window_bounds(i64::MAX - 60_000, 1), Some((i64::MAX - 60_000, i64::MAX - 59_999)));
    }

    #[test]
    fn fold_tracks_ohlcv() {
        let mut state = CandleState::seed(&trade(1_000, 100.0, 1.0), minute(1_000), 7);
        state.fold(&trade(30_000, 105.0, 2.0), 8);
        state.fold(&trade(59_000, 98.0, 0.5), 9);

        assert!((state.open - 100.0).abs() < 1e-10);
        assert!((state.high - 105.0).abs() < 1e-10);
        assert!((state.low - 98.0).abs() < 1e-10);
        assert!((state.close - 98.0).abs() < 1e-10);
        assert!((state.volume - 3.5).abs() < 1e-10);
        assert_eq!(state.trade_count, 3);
        assert_eq!(state.first_offset(), 7);
        assert_eq!(state.window_end_ms, 60_000);
    }

    #[test]
    fn open_and_close_follow_event_time() {
        // Arrival order: 30s, 50s, 10s.  The 10s trade becomes the open;
        // the 50s trade remains the close.
        let mut state = CandleState::seed(&trade(30_000, 200.0, 1.0), minute(30_000), 0);
        state.fold(&trade(50_000, 210.0, 1.0), 1);
        state.fold(&trade(10_000, 190.0, 1.0), 2);

        assert!((state.open - 190.0).abs() < 1e-10);
        assert!((state.close - 210.0).abs() < 1e-10);
        assert!((state.low - 190.0).abs() < 1e-10);
        assert!((state.high - 210.0).abs() < 1e-10);
    }

    #[test]
    fn equal_timestamps_tie_break_by_arrival() {
        let mut state = CandleState::seed(&trade(5_000, 10.0, 1.0), minute(5_000), 0);
        state.fold(&trade(5_000, 11.0, 1.0), 1);
        state.fold(&trade(5_000, 12.0, 1.0), 2);

        // First arrival keeps the open, last arrival takes the close.
        assert!((state.open - 10.0).abs() < 1e-10);
        assert!((state.close - 12.0).abs() < 1e-10);
    }

    #[test]
    fn seal_keeps_window_bounds() {
        let state = CandleState::seed(&trade(61_000, 50.0, 2.0), minute(61_000), 0);
        let candle = state.seal("ETH/USD", 60);
        assert_eq!(candle.pair, "ETH/USD");
        assert_eq!(candle.window_start_ms, 60_000);
        assert_eq!(candle.window_end_ms, 120_000);
        assert_eq!(candle.trade_count, 1);
        assert_eq!(candle.candle_seconds, 60);
    }

    #[test]
    fn gap_candle_is_flat() {
        let c = gap_candle("BTC/USD", 120_000, 60_000, 42.0);
        assert!(c.is_gap_fill());
        assert!((c.open - 42.0).abs() < 1e-10);
        assert!((c.low - c.high).abs() < 1e-10);
        assert!((c.volume).abs() < 1e-10);
        assert_eq!(c.window_end_ms, 180_000);
    }
}
