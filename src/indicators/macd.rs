// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line  = EMA(fast) - EMA(slow)
// Signal     = EMA(signal_period) of the MACD line
// Histogram  = MACD - Signal
//
// Standard parameters: fast 12, slow 26, signal 9.
// =============================================================================

use super::ema::calculate_ema;

/// One point of the MACD triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the latest MACD point for `closes`.
///
/// Returns `None` when there is not enough data for the slow EMA plus the
/// signal EMA seed.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdPoint> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_slow.is_empty() {
        return None;
    }

    // Both series end at the last close; align them by their tails.
    let n = ema_slow.len().min(ema_fast.len());
    let macd_line: Vec<f64> = ema_fast[ema_fast.len() - n..]
        .iter()
        .zip(&ema_slow[ema_slow.len() - n..])
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = calculate_ema(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_line.last()?;

    let histogram = macd - signal;
    if !histogram.is_finite() {
        return None;
    }

    Some(MacdPoint {
        macd,
        signal,
        histogram,
    })
}

/// Standard 12/26/9 MACD.
pub fn calculate_macd_standard(closes: &[f64]) -> Option<MacdPoint> {
    calculate_macd(closes, 12, 26, 9)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_rejects_degenerate_inputs() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
        assert!(calculate_macd(&closes[..20], 12, 26, 9).is_none());
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let closes: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        let point = calculate_macd_standard(&closes).unwrap();
        assert!(point.macd > 0.0, "rising series should have positive MACD");
    }

    #[test]
    fn macd_negative_in_downtrend() {
        let closes: Vec<f64> = (1..=120).rev().map(|x| x as f64).collect();
        let point = calculate_macd_standard(&closes).unwrap();
        assert!(point.macd < 0.0);
    }

    #[test]
    fn histogram_is_macd_minus_signal() {
        let closes: Vec<f64> = (0..150)
            .map(|i| 100.0 + (i as f64 * 0.2).sin() * 8.0)
            .collect();
        let p = calculate_macd_standard(&closes).unwrap();
        assert!((p.histogram - (p.macd - p.signal)).abs() < 1e-12);
    }
}
