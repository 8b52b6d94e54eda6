// =============================================================================
// Stage metrics: lock-free counters shared by every partition worker
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters for one running stage.  Workers of the same stage share one
/// instance through an `Arc`.
#[derive(Default)]
pub struct StageMetrics {
    records_in: AtomicU64,
    malformed: AtomicU64,
    late_trades: AtomicU64,
    replay_skipped: AtomicU64,
    candles_emitted: AtomicU64,
    gap_candles: AtomicU64,
    rejected_candles: AtomicU64,
    indicator_records: AtomicU64,
    commits: AtomicU64,
    upstream_retries: AtomicU64,
}

/// Serialisable point-in-time copy of [`StageMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub records_in: u64,
    pub malformed: u64,
    pub late_trades: u64,
    /// Record-level rejections of inputs replayed after a restore.
    #[serde(default)]
    pub replay_skipped: u64,
    pub candles_emitted: u64,
    pub gap_candles: u64,
    pub rejected_candles: u64,
    pub indicator_records: u64,
    pub commits: u64,
    pub upstream_retries: u64,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_in(&self) {
        self.records_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn late_trade(&self) {
        self.late_trades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replay_skipped(&self) {
        self.replay_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn candle_emitted(&self, gap_fill: bool) {
        self.candles_emitted.fetch_add(1, Ordering::Relaxed);
        if gap_fill {
            self.gap_candles.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn candle_rejected(&self) {
        self.rejected_candles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn indicator_record(&self) {
        self.indicator_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_retry(&self) {
        self.upstream_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_in: self.records_in.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            late_trades: self.late_trades.load(Ordering::Relaxed),
            replay_skipped: self.replay_skipped.load(Ordering::Relaxed),
            candles_emitted: self.candles_emitted.load(Ordering::Relaxed),
            gap_candles: self.gap_candles.load(Ordering::Relaxed),
            rejected_candles: self.rejected_candles.load(Ordering::Relaxed),
            indicator_records: self.indicator_records.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            upstream_retries: self.upstream_retries.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for StageMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StageMetrics").field(&self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = StageMetrics::new();
        m.record_in();
        m.record_in();
        m.late_trade();
        m.replay_skipped();
        m.candle_emitted(false);
        m.candle_emitted(true);
        let snap = m.snapshot();
        assert_eq!(snap.records_in, 2);
        assert_eq!(snap.late_trades, 1);
        assert_eq!(snap.replay_skipped, 1);
        assert_eq!(snap.candles_emitted, 2);
        assert_eq!(snap.gap_candles, 1);
        assert_eq!(snap.commits, 0);
    }
}
