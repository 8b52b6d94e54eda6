// =============================================================================
// Rate of Change (ROC): Momentum Indicator
// =============================================================================
//
// ROC measures the percentage change in price over a look-back period:
//   ROC = ((close - close_n) / close_n) * 100

/// Calculate the Rate of Change for the given closing prices and period.
///
/// Returns one value per close starting at index `period`.  A zero reference
/// close has no defined ROC and yields `None` at that position.
pub fn calculate_roc(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    (period..closes.len())
        .map(|i| {
            let prev = closes[i - period];
            if prev == 0.0 {
                return None;
            }
            let roc = ((closes[i] - prev) / prev) * 100.0;
            roc.is_finite().then_some(roc)
        })
        .collect()
}

/// Return the most recent ROC value.
pub fn current_roc(closes: &[f64], period: usize) -> Option<f64> {
    calculate_roc(closes, period).last().copied().flatten()
}
