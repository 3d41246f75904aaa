// =============================================================================
// Signal Quality Scorer — weighted composite of execution-quality factors
// =============================================================================
//
// Components, each normalised into [0, 1], then combined as a weighted
// average:
//
//   confluence          0.30  momentum / volume / regime agreement
//   volume quality      0.25  volume vs its 20-bar mean, saturating
//   microstructure      0.25  inverse relative bid-ask spread
//   timeframe alignment 0.20  signed agreement across 3/10/20-bar trends
// =============================================================================

use crate::indicators::roc::calculate_roc;
use crate::market_data::{Bar, Tick};
use crate::regime::{Bias, RegimeSnapshot};
use crate::types::TradeAction;

const W_CONFLUENCE: f64 = 0.30;
const W_VOLUME: f64 = 0.25;
const W_MICROSTRUCTURE: f64 = 0.25;
const W_TIMEFRAME: f64 = 0.20;

/// Number of bars the volume baseline averages over.
const VOLUME_BASELINE_BARS: usize = 20;
/// Relative spread treated as completely unacceptable (score 0).
const SPREAD_CEILING: f64 = 0.005;

/// Everything the scorer needs, assembled by the caller from the cache so
/// the scorer itself stays pure and testable.
#[derive(Debug, Clone)]
pub struct QualityInputs {
    pub action: TradeAction,
    pub tick: Tick,
    /// Recent 1-minute bars, oldest first. 20+ bars give full fidelity.
    pub bars_1m: Vec<Bar>,
    pub regime: RegimeSnapshot,
}

/// Stateless composite scorer.
#[derive(Debug, Clone, Default)]
pub struct QualityScorer;

impl QualityScorer {
    /// Composite quality in [0, 1].
    pub fn score(&self, inputs: &QualityInputs) -> f64 {
        let closes: Vec<f64> = inputs.bars_1m.iter().map(|b| b.close).collect();

        let confluence = self.confluence(inputs, &closes);
        let volume = self.volume_quality(&inputs.bars_1m);
        let micro = self.microstructure(&inputs.tick);
        let timeframe = self.timeframe_alignment(inputs.action, &closes);

        (confluence * W_CONFLUENCE
            + volume * W_VOLUME
            + micro * W_MICROSTRUCTURE
            + timeframe * W_TIMEFRAME)
            .clamp(0.0, 1.0)
    }

    /// Agreement of short-horizon momentum, above-average volume, and regime
    /// direction with the signal's action. Each agreeing factor contributes a
    /// third.
    fn confluence(&self, inputs: &QualityInputs, closes: &[f64]) -> f64 {
        let mut score = 0.0;

        let direction = match inputs.action {
            TradeAction::Buy => 1.0,
            TradeAction::Sell => -1.0,
        };

        if let Some(roc) = calculate_roc(closes, 5) {
            if roc * direction > 0.0 {
                score += 1.0 / 3.0;
            }
        }

        if self.volume_ratio(&inputs.bars_1m).unwrap_or(0.0) > 1.0 {
            score += 1.0 / 3.0;
        }

        let regime_agrees = matches!(
            (inputs.regime.bias, inputs.action),
            (Bias::Bullish, TradeAction::Buy) | (Bias::Bearish, TradeAction::Sell)
        );
        if regime_agrees {
            score += 1.0 / 3.0;
        }

        score
    }

    /// Latest bar volume over the 20-bar mean, saturating at 2x.
    fn volume_quality(&self, bars: &[Bar]) -> f64 {
        match self.volume_ratio(bars) {
            Some(ratio) => (ratio / 2.0).clamp(0.0, 1.0),
            None => 0.5, // unknown volume is treated as average
        }
    }

    fn volume_ratio(&self, bars: &[Bar]) -> Option<f64> {
        if bars.len() < 2 {
            return None;
        }
        let window = &bars[bars.len().saturating_sub(VOLUME_BASELINE_BARS + 1)..bars.len() - 1];
        if window.is_empty() {
            return None;
        }
        let mean: f64 = window.iter().map(|b| b.volume).sum::<f64>() / window.len() as f64;
        if mean <= 0.0 {
            return None;
        }
        Some(bars.last()?.volume / mean)
    }

    /// 1 at a zero spread, 0 at `SPREAD_CEILING` and beyond. A one-sided
    /// book scores 0.
    fn microstructure(&self, tick: &Tick) -> f64 {
        match tick.spread_frac() {
            Some(spread) => (1.0 - spread / SPREAD_CEILING).clamp(0.0, 1.0),
            None => 0.0,
        }
    }

    /// Signed agreement of the 3/10/20-bar trends with the action; each
    /// aligned horizon contributes a third.
    fn timeframe_alignment(&self, action: TradeAction, closes: &[f64]) -> f64 {
        let direction = match action {
            TradeAction::Buy => 1.0,
            TradeAction::Sell => -1.0,
        };
        let mut score = 0.0;
        for period in [3usize, 10, 20] {
            if let Some(roc) = calculate_roc(closes, period) {
                if roc * direction > 0.0 {
                    score += 1.0 / 3.0;
                }
            }
        }
        score
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::RegimeSnapshot;
    use chrono::{TimeZone, Utc};

    fn bar(i: i64, close: f64, volume: f64) -> Bar {
        Bar {
            start: Utc.timestamp_opt(i * 60, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume,
        }
    }

    fn tick(ltp: f64, bid: f64, ask: f64) -> Tick {
        Tick {
            ltp,
            open: ltp,
            high: ltp,
            low: ltp,
            close_prev: ltp,
            volume: 100.0,
            bid,
            ask,
            oi: None,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn rising_inputs() -> QualityInputs {
        let bars: Vec<Bar> = (0..30)
            .map(|i| bar(i, 100.0 + i as f64 * 0.5, if i >= 29 { 300.0 } else { 100.0 }))
            .collect();
        QualityInputs {
            action: TradeAction::Buy,
            tick: tick(115.0, 114.99, 115.01),
            bars_1m: bars,
            regime: RegimeSnapshot {
                bias: Bias::Bullish,
                strength: 6.0,
                ..Default::default()
            },
        }
    }

    #[test]
    fn aligned_buy_scores_high() {
        let score = QualityScorer.score(&rising_inputs());
        assert!(score > 0.8, "expected high quality, got {score}");
    }

    #[test]
    fn counter_trend_sell_scores_low() {
        let mut inputs = rising_inputs();
        inputs.action = TradeAction::Sell;
        let score = QualityScorer.score(&inputs);
        assert!(score < 0.5, "expected low quality, got {score}");
    }

    #[test]
    fn wide_spread_hurts_score() {
        let mut inputs = rising_inputs();
        let tight = QualityScorer.score(&inputs);
        inputs.tick = tick(115.0, 114.0, 116.0); // ~1.7% spread
        let wide = QualityScorer.score(&inputs);
        assert!(wide < tight);
    }

    #[test]
    fn score_is_bounded() {
        let inputs = QualityInputs {
            action: TradeAction::Buy,
            tick: tick(100.0, 0.0, 0.0),
            bars_1m: Vec::new(),
            regime: RegimeSnapshot::default(),
        };
        let score = QualityScorer.score(&inputs);
        assert!((0.0..=1.0).contains(&score));
    }
}
