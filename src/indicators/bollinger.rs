// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ).  σ is the population standard deviation of
// the same `period` closes.

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Calculate Bollinger Bands for the given closing prices.
///
/// Returns `None` when:
/// - Fewer than `period` data points.
/// - Any band is non-finite.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;

    if upper.is_finite() && lower.is_finite() {
        Some(BollingerResult {
            upper,
            middle,
            lower,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!((bb.middle - 10.5).abs() < 1e-10);
    }

    #[test]
    fn bollinger_known_std() {
        // [2, 4, 4, 4, 5, 5, 7, 9]: mean 5, population σ 2.
        let closes = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let bb = calculate_bollinger(&closes, 8, 2.0).unwrap();
        assert!((bb.middle - 5.0).abs() < 1e-10);
        assert!((bb.upper - 9.0).abs() < 1e-10);
        assert!((bb.lower - 1.0).abs() < 1e-10);
    }

    #[test]
    fn bollinger_insufficient_data() {
        let closes = vec![1.0, 2.0, 3.0];
        assert!(calculate_bollinger(&closes, 20, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat() {
        let closes = vec![100.0; 20];
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!((bb.upper - bb.lower).abs() < 1e-10);
    }
}
