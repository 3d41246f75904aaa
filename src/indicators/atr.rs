// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR seeds with the SMA of the first `period` TR values, then applies
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market_data::Bar;

/// Most recent ATR over `bars` (oldest first).
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// bars, or any intermediate value is non-finite.
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut true_ranges = Vec::with_capacity(bars.len() - 1);
    for pair in bars.windows(2) {
        let prev_close = pair[0].close;
        let bar = &pair[1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        true_ranges.push(tr);
    }

    let period_f = period as f64;
    let mut atr = true_ranges[..period].iter().sum::<f64>() / period_f;
    if !atr.is_finite() {
        return None;
    }

    for &tr in &true_ranges[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    Some(atr)
}

/// ATR expressed as a fraction of the last close. Comparable across symbols
/// with different price scales.
pub fn calculate_atr_frac(bars: &[Bar], period: usize) -> Option<f64> {
    let atr = calculate_atr(bars, period)?;
    let last_close = bars.last()?.close;
    if last_close <= 0.0 {
        return None;
    }
    Some(atr / last_close)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            start: Utc.timestamp_opt(i * 60, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn atr_rejects_degenerate_inputs() {
        let bars: Vec<Bar> = (0..10).map(|i| bar(i, 100.0, 105.0, 95.0, 102.0)).collect();
        assert!(calculate_atr(&bars, 0).is_none());
        assert!(calculate_atr(&bars, 14).is_none());
    }

    #[test]
    fn atr_constant_range_converges() {
        let bars: Vec<Bar> = (0..40)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                bar(i, base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let atr = calculate_atr(&bars, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10, got {atr}");
    }

    #[test]
    fn atr_reflects_gaps() {
        // Gap up: |high - prev_close| dominates the plain high-low range.
        let bars = vec![
            bar(0, 100.0, 105.0, 95.0, 95.0),
            bar(1, 110.0, 115.0, 108.0, 112.0),
            bar(2, 112.0, 118.0, 110.0, 115.0),
            bar(3, 115.0, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&bars, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_frac_scales_by_close() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0;
                bar(i, base, base + 2.0, base - 2.0, base)
            })
            .collect();
        let frac = calculate_atr_frac(&bars, 14).unwrap();
        assert!((frac - 0.04).abs() < 0.005, "got {frac}");
    }
}
