// =============================================================================
// Bollinger Bands
// =============================================================================
//
//   middle = SMA(period)
//   upper  = middle + k * stddev
//   lower  = middle - k * stddev
//   width  = (upper - lower) / middle        (relative band width)
//   %B     = (close - lower) / (upper - lower)
//
// %B > 1 means the close sits above the upper band; < 0 below the lower.
// =============================================================================

/// The computed bands for the most recent close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
    pub width: f64,
    pub percent_b: f64,
}

/// Bands over the last `period` closes with `k` standard deviations.
///
/// Returns `None` on short input, a zero middle band, or a degenerate
/// (zero-width) band, so callers never divide by zero.
pub fn bollinger_bands(closes: &[f64], period: usize, k: f64) -> Option<BollingerBands> {
    if period < 2 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle: f64 = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 || !middle.is_finite() {
        return None;
    }

    let variance: f64 =
        window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / period as f64;
    let stddev = variance.sqrt();
    if !stddev.is_finite() {
        return None;
    }

    let upper = middle + k * stddev;
    let lower = middle - k * stddev;
    let span = upper - lower;
    if span <= 0.0 {
        return None; // flat window — no meaningful bands
    }

    let close = *window.last()?;
    Some(BollingerBands {
        middle,
        upper,
        lower,
        width: span / middle,
        percent_b: (close - lower) / span,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_on_degenerate_input() {
        assert!(bollinger_bands(&[], 20, 2.0).is_none());
        assert!(bollinger_bands(&[1.0; 10], 20, 2.0).is_none());
        // Flat window: zero stddev, no bands.
        assert!(bollinger_bands(&[100.0; 25], 20, 2.0).is_none());
    }

    #[test]
    fn bands_bracket_the_mean() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let bands = bollinger_bands(&closes, 20, 2.0).unwrap();
        assert!(bands.lower < bands.middle);
        assert!(bands.middle < bands.upper);
        assert!(bands.width > 0.0);
    }

    #[test]
    fn breakout_close_pushes_percent_b_above_one() {
        let mut closes = vec![100.0, 101.0, 99.0, 100.5, 99.5, 100.0, 101.0, 99.0, 100.0, 100.5];
        closes.push(115.0); // breakout bar
        let bands = bollinger_bands(&closes, 10, 2.0).unwrap();
        assert!(bands.percent_b > 1.0, "%B {} not a breakout", bands.percent_b);
    }

    #[test]
    fn collapse_close_pushes_percent_b_below_zero() {
        let mut closes = vec![100.0, 101.0, 99.0, 100.5, 99.5, 100.0, 101.0, 99.0, 100.0, 100.5];
        closes.push(85.0);
        let bands = bollinger_bands(&closes, 10, 2.0).unwrap();
        assert!(bands.percent_b < 0.0);
    }
}
