// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
//   SMA = (close_{t-n+1} + ... + close_t) / n

/// Mean of the last `period` closes.  `None` when fewer are available.
pub fn calculate_sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let sma = window.iter().sum::<f64>() / period as f64;
    sma.is_finite().then_some(sma)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_uses_trailing_window() {
        assert!(calculate_sma(&[10.0, 20.0], 3).is_none());
        let v = calculate_sma(&[10.0, 20.0, 30.0], 3).unwrap();
        assert!((v - 20.0).abs() < 1e-10);
        let v = calculate_sma(&[10.0, 20.0, 30.0, 40.0], 3).unwrap();
        assert!((v - 30.0).abs() < 1e-10);
    }

    #[test]
    fn sma_period_zero() {
        assert!(calculate_sma(&[1.0], 0).is_none());
    }

    #[test]
    fn sma_rejects_non_finite() {
        assert!(calculate_sma(&[1.0, f64::INFINITY], 2).is_none());
    }
}
