// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range per bar:
//
//   TR = max(H - L, |H - prev_close|, |L - prev_close|)
//
// ATR seeds with the SMA of the first `period` TR values and then smooths:
//
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::types::Ohlcv;

/// Latest ATR for `bars` (oldest first) with look-back `period`.
///
/// Needs `period + 1` bars (each TR consumes the previous close). Returns
/// `None` on short input or a non-finite intermediate.
pub fn average_true_range(bars: &[Ohlcv], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values = Vec::with_capacity(bars.len() - 1);
    for pair in bars.windows(2) {
        let prev_close = pair[0].close;
        let bar = &pair[1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        tr_values.push(tr);
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    (atr.is_finite() && atr >= 0.0).then_some(atr)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Ohlcv {
        Ohlcv {
            open: close,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn guards_on_degenerate_input() {
        let bars = vec![bar(105.0, 95.0, 100.0); 10];
        assert!(average_true_range(&bars, 0).is_none());
        assert!(average_true_range(&bars, 14).is_none()); // needs 15
    }

    #[test]
    fn constant_range_converges_to_that_range() {
        let bars: Vec<Ohlcv> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                bar(base + 5.0, base - 5.0, base)
            })
            .collect();
        let atr = average_true_range(&bars, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ~10, got {atr}");
    }

    #[test]
    fn gap_uses_previous_close() {
        // Second bar gaps far above the first close: TR must use
        // |high - prev_close|, which dwarfs high - low.
        let bars = vec![
            bar(101.0, 99.0, 100.0),
            bar(121.0, 120.0, 120.5),
            bar(122.0, 120.0, 121.0),
        ];
        let atr = average_true_range(&bars, 2).unwrap();
        assert!(atr > 10.0, "gap TR not reflected: {atr}");
    }

    #[test]
    fn atr_is_positive() {
        let bars: Vec<Ohlcv> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.5).sin() * 10.0;
                bar(base + 2.0, base - 2.0, base + 0.5)
            })
            .collect();
        assert!(average_true_range(&bars, 14).unwrap() > 0.0);
    }
}
