// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
// Step 1 — Price deltas from consecutive closes.
// Step 2 — Seed average gain / loss with the SMA of the first `period` deltas.
// Step 3 — Wilder smoothing:
//            avg = (prev_avg * (period - 1) + current) / period
// Step 4 — RSI = 100 - 100 / (1 + avg_gain / avg_loss)
//
// Thresholds used downstream: > 70 overbought, < 30 oversold.
// =============================================================================

/// Compute the RSI series for `closes` with look-back `period`.
///
/// # Edge cases
/// - `period == 0` or fewer than `period + 1` closes => empty vec.
/// - Zero average loss (no down moves) clamps RSI to 100.
/// - Non-finite results truncate the series.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut out = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_value(avg_gain, avg_loss) {
        Some(v) => out.push(v),
        None => return Vec::new(),
    }

    for &d in &deltas[period..] {
        let (gain, loss) = if d > 0.0 { (d, 0.0) } else { (0.0, d.abs()) };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        match rsi_value(avg_gain, avg_loss) {
            Some(v) => out.push(v),
            None => break,
        }
    }

    out
}

/// Most recent RSI value, or `None` when it cannot be computed.
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    calculate_rsi(closes, period).last().copied()
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    if !avg_gain.is_finite() || !avg_loss.is_finite() {
        return None;
    }
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    let rsi = 100.0 - 100.0 / (1.0 + rs);
    rsi.is_finite().then_some(rsi)
}
