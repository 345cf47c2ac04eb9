// =============================================================================
// Rate of Change (ROC) — momentum over a look-back window
// =============================================================================
//
//   ROC = ((close - close_n) / close_n) * 100
//
// Positive values mean upward momentum over the window.

/// Latest ROC (percent) for `closes` with look-back `period`.
pub fn rate_of_change(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() <= period {
        return None;
    }

    let latest = *closes.last()?;
    let base = closes[closes.len() - 1 - period];
    if base == 0.0 || !base.is_finite() || !latest.is_finite() {
        return None;
    }

    let roc = (latest - base) / base * 100.0;
    roc.is_finite().then_some(roc)
}
