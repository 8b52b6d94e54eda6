// =============================================================================
// Candle Aggregator: trades in, sealed candles out
// =============================================================================
//
// Per trade:
//   1. Compute the trade's window.  If that window is already behind the pair's
//      watermark it was sealed earlier: the trade is late and is dropped.
//   2. Fold the trade into the window's `CandleState` (created on demand).
//   3. Advance the pair's watermark and seal every open window of the pair
//      whose end is <= the watermark, oldest first.
//   4. Apply the idle policy to the other pairs of the partition.
//
// All state is owned by the aggregator; one aggregator serves one partition.
// Pairs are kept in a `BTreeMap` so that multi-pair emissions (idle sealing,
// drain) come out in a stable order.
// =============================================================================

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::watermark::{IdlePolicy, PairClock};
use super::window::{gap_candle, window_bounds, CandleState, WindowKey};
use crate::errors::PipelineError;
use crate::runtime_config::PipelineConfig;
use crate::types::{Candle, TradeEvent};

/// Window and lateness settings of one aggregator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatorConfig {
    pub window_ms: i64,
    pub lateness_ms: i64,
    pub idle_policy: IdlePolicy,
    pub fill_gaps: bool,
}

impl AggregatorConfig {
    pub fn candle_seconds(&self) -> u64 {
        (self.window_ms / 1_000) as u64
    }
}

impl From<&PipelineConfig> for AggregatorConfig {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            window_ms: cfg.window_ms(),
            lateness_ms: cfg.lateness_ms,
            idle_policy: cfg.idle_policy,
            fill_gaps: cfg.fill_gaps,
        }
    }
}

/// Result of folding one trade.
#[derive(Debug, Clone, Default)]
pub struct FoldOutcome {
    /// Candles sealed by this trade, in emission order.
    pub candles: Vec<Candle>,
    /// The trade's pair watermark after the fold.
    pub watermark_ms: i64,
}

/// Checkpointed progress of one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairProgress {
    pub max_event_ms: i64,
    pub watermark_ms: i64,
    #[serde(default)]
    pub last_emitted_start_ms: Option<i64>,
    #[serde(default)]
    pub last_close: Option<f64>,
}

/// Everything a resumed aggregator needs besides the replayed trades.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatorProgress {
    #[serde(default)]
    pub pairs: BTreeMap<String, PairProgress>,
    #[serde(default)]
    pub partition_max_event_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct PairState {
    clock: PairClock,
    /// Open windows keyed by window start.
    open: BTreeMap<i64, CandleState>,
    last_emitted_start_ms: Option<i64>,
    last_close: Option<f64>,
}

/// Stateful tumbling-window aggregator for all pairs of one partition.
#[derive(Debug)]
pub struct CandleAggregator {
    config: AggregatorConfig,
    pairs: BTreeMap<String, PairState>,
    partition_max_event_ms: i64,
}

impl CandleAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            pairs: BTreeMap::new(),
            partition_max_event_ms: i64::MIN,
        }
    }

    /// Fold one trade read from log offset `offset`.
    ///
    /// Returns `Err(LateTrade)` when the trade's window has already been
    /// sealed and `Err(Malformed)` when its window cannot be represented; the
    /// aggregator is left untouched in both cases.
    pub fn fold(&mut self, trade: &TradeEvent, offset: u64) -> Result<FoldOutcome, PipelineError> {
        self.fold_at(trade, offset, Instant::now())
    }

    /// [`fold`](Self::fold) with an explicit arrival instant.
    pub fn fold_at(
        &mut self,
        trade: &TradeEvent,
        offset: u64,
        now: Instant,
    ) -> Result<FoldOutcome, PipelineError> {
        let window_ms = self.config.window_ms;
        let Some((start, end)) = window_bounds(trade.timestamp, window_ms) else {
            return Err(PipelineError::Malformed(format!(
                "timestamp {} of {} has no representable window",
                trade.timestamp, trade.pair
            )));
        };

        let state = self.pairs.entry(trade.pair.clone()).or_default();
        let watermark_ms = state.clock.watermark_ms();
        if end <= watermark_ms {
            return Err(PipelineError::LateTrade {
                pair: trade.pair.clone(),
                window_end_ms: end,
                watermark_ms,
            });
        }

        match state.open.get_mut(&start) {
            Some(candle) => candle.fold(trade, offset),
            None => {
                state
                    .open
                    .insert(start, CandleState::seed(trade, (start, end), offset));
            }
        }

        let watermark_ms = state.clock.observe(trade.timestamp, self.config.lateness_ms, now);
        let mut candles = Vec::new();
        seal_until(&trade.pair, state, watermark_ms, &self.config, &mut candles);

        self.partition_max_event_ms = self.partition_max_event_ms.max(trade.timestamp);
        if matches!(self.config.idle_policy, IdlePolicy::EventTime { .. }) {
            self.seal_idle(now, &mut candles);
        }

        Ok(FoldOutcome {
            candles,
            watermark_ms,
        })
    }

    /// Apply the idle policy without a new trade (called from the worker's
    /// poll loop).  Only the processing-time policy can make progress here.
    pub fn advance_idle(&mut self, now: Instant) -> Vec<Candle> {
        let mut candles = Vec::new();
        if matches!(self.config.idle_policy, IdlePolicy::ProcessingTime { .. }) {
            self.seal_idle(now, &mut candles);
        }
        candles
    }

    fn seal_idle(&mut self, now: Instant, out: &mut Vec<Candle>) {
        let policy = self.config.idle_policy;
        let partition_max = self.partition_max_event_ms;
        for (pair, state) in self.pairs.iter_mut() {
            let Some(newest_end) = state.open.values().next_back().map(|c| c.window_end_ms) else {
                continue;
            };
            if !state.clock.is_idle(policy, partition_max, now) {
                continue;
            }
            let forced = state.clock.force(newest_end);
            debug!(pair = %pair, watermark_ms = forced, "idle pair: watermark forced");
            seal_until(pair, state, forced, &self.config, out);
        }
    }

    /// Seal every open window of every pair (end of a bounded input).
    pub fn drain(&mut self) -> Vec<Candle> {
        let mut candles = Vec::new();
        for (pair, state) in self.pairs.iter_mut() {
            if let Some(newest_end) = state.open.values().next_back().map(|c| c.window_end_ms) {
                let forced = state.clock.force(newest_end);
                seal_until(pair, state, forced, &self.config, &mut candles);
            }
        }
        candles
    }

    /// Current watermark of `pair`, if the pair has been seen.
    #[cfg(test)]
    pub fn watermark(&self, pair: &str) -> Option<i64> {
        self.pairs.get(pair).map(|s| s.clock.watermark_ms())
    }

    /// Number of open windows for `pair`.
    #[cfg(test)]
    pub fn open_windows(&self, pair: &str) -> usize {
        self.pairs.get(pair).map_or(0, |s| s.open.len())
    }

    /// Smallest log offset that must be replayed to rebuild every open window;
    /// `next_offset` when nothing is open.
    pub fn safe_position(&self, next_offset: u64) -> u64 {
        self.pairs
            .values()
            .flat_map(|s| s.open.values())
            .map(CandleState::first_offset)
            .fold(next_offset, u64::min)
    }

    pub fn progress(&self) -> AggregatorProgress {
        AggregatorProgress {
            pairs: self
                .pairs
                .iter()
                .map(|(pair, s)| {
                    (
                        pair.clone(),
                        PairProgress {
                            max_event_ms: s.clock.max_event_ms(),
                            watermark_ms: s.clock.watermark_ms(),
                            last_emitted_start_ms: s.last_emitted_start_ms,
                            last_close: s.last_close,
                        },
                    )
                })
                .collect(),
            partition_max_event_ms: (self.partition_max_event_ms != i64::MIN)
                .then_some(self.partition_max_event_ms),
        }
    }

    /// Reset to a checkpointed state.  Open windows are not part of the
    /// checkpoint; they are rebuilt by replaying from the safe position.
    pub fn restore(&mut self, progress: AggregatorProgress) {
        self.pairs = progress
            .pairs
            .into_iter()
            .map(|(pair, p)| {
                let state = PairState {
                    clock: PairClock::restored(p.max_event_ms, p.watermark_ms),
                    open: BTreeMap::new(),
                    last_emitted_start_ms: p.last_emitted_start_ms,
                    last_close: p.last_close,
                };
                (pair, state)
            })
            .collect();
        self.partition_max_event_ms = progress.partition_max_event_ms.unwrap_or(i64::MIN);
    }
}

/// Seal, oldest first, every open window of `pair` ending at or before
/// `watermark_ms`, filling gaps when configured.
fn seal_until(
    pair: &str,
    state: &mut PairState,
    watermark_ms: i64,
    config: &AggregatorConfig,
    out: &mut Vec<Candle>,
) {
    while let Some(entry) = state.open.first_entry() {
        if entry.get().window_end_ms > watermark_ms {
            break;
        }
        let sealed = entry.remove().seal(pair, config.candle_seconds());

        if config.fill_gaps {
            if let (Some(prev_start), Some(prev_close)) = (state.last_emitted_start_ms, state.last_close) {
                let mut gap_start = prev_start + config.window_ms;
                while gap_start < sealed.window_start_ms {
                    out.push(gap_candle(pair, gap_start, config.window_ms, prev_close));
                    gap_start += config.window_ms;
                }
            }
        }

        debug!(
            window = %WindowKey { pair: pair.to_string(), window_start_ms: sealed.window_start_ms },
            trades = sealed.trade_count,
            close = sealed.close,
            "candle sealed"
        );
        state.last_emitted_start_ms = Some(sealed.window_start_ms);
        state.last_close = Some(sealed.close);
        out.push(sealed);
    }
}
