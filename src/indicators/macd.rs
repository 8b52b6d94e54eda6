// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   line      = EMA_fast(close) - EMA_slow(close)
//   signal    = EMA_signal(line)
//   histogram = line - signal
//
// The line exists from close index `slow - 1`; the signal needs `signal` line
// values on top, so the first complete MACD needs `slow + signal - 1` closes.
// =============================================================================

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Latest MACD triple, `None` with insufficient history.
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdResult> {
    if fast == 0 || signal == 0 || fast >= slow || closes.len() < slow + signal - 1 {
        return None;
    }

    let fast_ema = calculate_ema(closes, fast);
    let slow_ema = calculate_ema(closes, slow);
    let expected_slow = closes.len() - slow + 1;
    if slow_ema.len() != expected_slow || fast_ema.len() != closes.len() - fast + 1 {
        return None;
    }

    // Align both series on the close index; fast starts `slow - fast` earlier.
    let offset = slow - fast;
    let line: Vec<f64> = slow_ema
        .iter()
        .zip(&fast_ema[offset..])
        .map(|(s, f)| f - s)
        .collect();

    let signal_series = calculate_ema(&line, signal);
    let macd = *line.last()?;
    let signal = *signal_series.last()?;
    let histogram = macd - signal;

    histogram.is_finite().then_some(MacdResult {
        macd,
        signal,
        histogram,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_needs_slow_plus_signal_history() {
        let closes: Vec<f64> = (1..=33).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
        let closes: Vec<f64> = (1..=34).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_some());
    }

    #[test]
    fn macd_flat_is_zero() {
        let closes = vec![50.0; 60];
        let m = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(m.macd.abs() < 1e-10);
        assert!(m.signal.abs() < 1e-10);
        assert!(m.histogram.abs() < 1e-10);
    }

    #[test]
    fn macd_rising_is_positive() {
        let closes: Vec<f64> = (1..=80).map(|x| 100.0 + x as f64).collect();
        let m = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(m.macd > 0.0);
        assert!((m.histogram - (m.macd - m.signal)).abs() < 1e-10);
    }

    #[test]
    fn macd_matches_manual_small_periods() {
        // fast 2, slow 3, signal 2 on [1, 2, 4, 8]
        let closes = [1.0, 2.0, 4.0, 8.0];
        let fast = calculate_ema(&closes, 2); // seeds at idx 1
        let slow = calculate_ema(&closes, 3); // seeds at idx 2
        let line = [fast[1] - slow[0], fast[2] - slow[1]];
        let signal = (line[0] + line[1]) / 2.0;

        let m = calculate_macd(&closes, 2, 3, 2).unwrap();
        assert!((m.macd - line[1]).abs() < 1e-10);
        assert!((m.signal - signal).abs() < 1e-10);
    }

    #[test]
    fn macd_rejects_bad_periods() {
        let closes = vec![1.0; 50];
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
        assert!(calculate_macd(&closes, 0, 12, 9).is_none());
    }
}
