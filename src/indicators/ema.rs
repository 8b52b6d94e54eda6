// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period` closes
// of the slice, so the value depends on how far back the history buffer
// reaches.  The calculator always passes the full per-pair buffer.
// =============================================================================

/// Compute the EMA series for the given `closes` slice and look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// Each output element corresponds to a close starting at index `period - 1`.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() < period` => empty vec
/// - A non-finite intermediate value truncates the series.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev_ema = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev_ema * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev_ema = ema;
    }

    result
}

/// Most recent EMA value, `None` until `period` closes are available.
pub fn current_ema(closes: &[f64], period: usize) -> Option<f64> {
    let series = calculate_ema(closes, period);
    // A truncated series means the latest close produced a non-finite value.
    if series.len() != closes.len().saturating_sub(period) + 1 {
        return None;
    }
    series.last().copied()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_empty_input() {
        assert!(calculate_ema(&[], 5).is_empty());
        assert!(current_ema(&[], 5).is_none());
    }

    #[test]
    fn ema_period_zero() {
        assert!(calculate_ema(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn ema_insufficient_data() {
        assert!(calculate_ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn ema_period_equals_length() {
        let closes = vec![2.0, 4.0, 6.0];
        let ema = calculate_ema(&closes, 3);
        assert_eq!(ema.len(), 1);
        // Should be the SMA = (2+4+6)/3 = 4.0
        assert!((ema[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        // 5-period EMA of [1..=10]: SMA seed 3.0, multiplier 1/3.
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 5);
        assert_eq!(ema.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        let mut expected_vec = vec![expected];
        for &c in &closes[5..] {
            expected = c * mult + expected * (1.0 - mult);
            expected_vec.push(expected);
        }
        for (a, b) in ema.iter().zip(expected_vec.iter()) {
            assert!((a - b).abs() < 1e-10, "got {a}, expected {b}");
        }
        let last = current_ema(&closes, 5).unwrap();
        assert!((last - expected).abs() < 1e-10);
    }

    #[test]
    fn ema_handles_nan_in_input() {
        let closes = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        let ema = calculate_ema(&closes, 3);
        // Seed is 2.0, the NaN close breaks the series.
        assert_eq!(ema.len(), 1);
        assert!(current_ema(&closes, 3).is_none());
    }

    #[test]
    fn ema_flat_series_is_flat() {
        let closes = vec![100.0; 40];
        let v = current_ema(&closes, 14).unwrap();
        assert!((v - 100.0).abs() < 1e-10);
    }
}
