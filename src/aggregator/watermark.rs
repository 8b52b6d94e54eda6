// =============================================================================
// Per-pair watermarks and the idle-advancement policy
// =============================================================================
//
// W(pair) = max(event time seen for pair) - lateness
//
// The watermark only moves forward.  A quiet pair never advances by itself, so
// an `IdlePolicy` decides when its open windows are force-sealed:
//
//   disabled         never
//   event_time       partition max event time >= pair max event time + timeout
//                    (deterministic: replaying the same input seals the same
//                    windows)
//   processing_time  no trade for the pair for `timeout` of wall-clock time
//                    (live liveness; replay may seal at different points)
// =============================================================================

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

fn default_idle_timeout_ms() -> i64 {
    300_000
}

/// When a pair without fresh trades may have its open windows sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdlePolicy {
    Disabled,
    EventTime {
        #[serde(default = "default_idle_timeout_ms")]
        timeout_ms: i64,
    },
    ProcessingTime {
        #[serde(default = "default_idle_timeout_ms")]
        timeout_ms: i64,
    },
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self::EventTime {
            timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl IdlePolicy {
    /// Same policy kind with a new timeout; `0` disables advancement.
    pub fn with_timeout(self, timeout_ms: i64) -> Self {
        if timeout_ms <= 0 {
            return Self::Disabled;
        }
        match self {
            Self::ProcessingTime { .. } => Self::ProcessingTime { timeout_ms },
            Self::Disabled | Self::EventTime { .. } => Self::EventTime { timeout_ms },
        }
    }
}

/// Event-time progress of one pair.
#[derive(Debug, Clone)]
pub struct PairClock {
    max_event_ms: i64,
    watermark_ms: i64,
    last_arrival: Instant,
}

impl PairClock {
    pub fn new() -> Self {
        Self {
            max_event_ms: i64::MIN,
            watermark_ms: i64::MIN,
            last_arrival: Instant::now(),
        }
    }

    /// Rebuild from checkpointed values.
    pub fn restored(max_event_ms: i64, watermark_ms: i64) -> Self {
        Self {
            max_event_ms,
            watermark_ms,
            last_arrival: Instant::now(),
        }
    }

    pub fn max_event_ms(&self) -> i64 {
        self.max_event_ms
    }

    pub fn watermark_ms(&self) -> i64 {
        self.watermark_ms
    }

    /// Account for a trade with event time `ts` that arrived at `now`.
    /// Returns the (possibly advanced) watermark.
    pub fn observe(&mut self, ts: i64, lateness_ms: i64, now: Instant) -> i64 {
        self.last_arrival = now;
        if ts > self.max_event_ms {
            self.max_event_ms = ts;
            self.watermark_ms = self.watermark_ms.max(ts.saturating_sub(lateness_ms));
        }
        self.watermark_ms
    }

    /// Force the watermark to at least `to_ms`.
    pub fn force(&mut self, to_ms: i64) -> i64 {
        self.watermark_ms = self.watermark_ms.max(to_ms);
        self.watermark_ms
    }

    /// Whether `policy` considers this pair idle.
    pub fn is_idle(&self, policy: IdlePolicy, partition_max_event_ms: i64, now: Instant) -> bool {
        match policy {
            IdlePolicy::Disabled => false,
            IdlePolicy::EventTime { timeout_ms } => {
                self.max_event_ms != i64::MIN
                    && partition_max_event_ms.saturating_sub(self.max_event_ms) >= timeout_ms
            }
            IdlePolicy::ProcessingTime { timeout_ms } => {
                now.saturating_duration_since(self.last_arrival)
                    >= Duration::from_millis(timeout_ms.max(0) as u64)
            }
        }
    }
}

impl Default for PairClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_trails_max_event_time() {
        let now = Instant::now();
        let mut clock = PairClock::new();
        assert_eq!(clock.observe(10_000, 5_000, now), 5_000);
        assert_eq!(clock.observe(20_000, 5_000, now), 15_000);
        // An older event never moves it back.
        assert_eq!(clock.observe(12_000, 5_000, now), 15_000);
        assert_eq!(clock.max_event_ms(), 20_000);
    }

    #[test]
    fn force_is_monotonic() {
        let mut clock = PairClock::restored(50_000, 45_000);
        assert_eq!(clock.force(40_000), 45_000);
        assert_eq!(clock.force(60_000), 60_000);
    }

    #[test]
    fn event_time_idleness() {
        let now = Instant::now();
        let mut clock = PairClock::new();
        let policy = IdlePolicy::EventTime { timeout_ms: 1_000 };
        assert!(!clock.is_idle(policy, 100_000, now), "no trades yet");
        clock.observe(10_000, 0, now);
        assert!(!clock.is_idle(policy, 10_999, now));
        assert!(clock.is_idle(policy, 11_000, now));
        assert!(!clock.is_idle(IdlePolicy::Disabled, 1_000_000, now));
    }

    #[test]
    fn processing_time_idleness() {
        let start = Instant::now();
        let mut clock = PairClock::new();
        clock.observe(10_000, 0, start);
        let policy = IdlePolicy::ProcessingTime { timeout_ms: 500 };
        assert!(!clock.is_idle(policy, 0, start + Duration::from_millis(499)));
        assert!(clock.is_idle(policy, 0, start + Duration::from_millis(500)));
    }

    #[test]
    fn with_timeout_keeps_kind() {
        let p = IdlePolicy::ProcessingTime { timeout_ms: 1 }.with_timeout(9);
        assert_eq!(p, IdlePolicy::ProcessingTime { timeout_ms: 9 });
        assert_eq!(IdlePolicy::Disabled.with_timeout(9), IdlePolicy::EventTime { timeout_ms: 9 });
        assert_eq!(IdlePolicy::default().with_timeout(0), IdlePolicy::Disabled);
    }

    #[test]
    fn policy_serde_shape() {
        let json = serde_json::to_string(&IdlePolicy::default()).unwrap();
        assert_eq!(json, r#"{"kind":"event_time","timeout_ms":300000}"#);
        let p: IdlePolicy = serde_json::from_str(r#"{"kind":"disabled"}"#).unwrap();
        assert_eq!(p, IdlePolicy::Disabled);
    }
}
