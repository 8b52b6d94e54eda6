// =============================================================================
// On-Balance Volume (OBV)
// =============================================================================
//
//   OBV_0 = 0
//   OBV_t = OBV_{t-1} + volume_t   if close_t > close_{t-1}
//         = OBV_{t-1} - volume_t   if close_t < close_{t-1}
//         = OBV_{t-1}              otherwise
//
// Accumulated over the candles passed in (the per-pair history buffer), so the
// value is bounded by the buffer and identical after a replay.

use crate::types::Candle;

/// OBV at the last candle.  `None` with fewer than two candles.
pub fn calculate_obv(candles: &[Candle]) -> Option<f64> {
    if candles.len() < 2 {
        return None;
    }
    let obv = candles.windows(2).fold(0.0_f64, |acc, w| {
        if w[1].close > w[0].close {
            acc + w[1].volume
        } else if w[1].close < w[0].close {
            acc - w[1].volume
        } else {
            acc
        }
    });
    obv.is_finite().then_some(obv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle {
            pair: "ETH/USD".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume,
            trade_count: 1,
            window_start_ms: 0,
            window_end_ms: 60_000,
            candle_seconds: 60,
        }
    }

    #[test]
    fn obv_accumulates_signed_volume() {
        let candles = [
            candle(10.0, 100.0),
            candle(11.0, 5.0),  // +5
            candle(10.5, 3.0),  // -3
            candle(10.5, 50.0), // unchanged
            candle(12.0, 2.0),  // +2
        ];
        let obv = calculate_obv(&candles).unwrap();
        assert!((obv - 4.0).abs() < 1e-10);
    }

    #[test]
    fn obv_needs_two_candles() {
        assert!(calculate_obv(&[candle(1.0, 1.0)]).is_none());
    }
}
