// =============================================================================
// Signal model — tagged records flowing strategy → dedup → gate → engine
// =============================================================================
//
// A signal is one record with two flags instead of a type hierarchy: the
// dedup bypass and gate bypass depend only on `management_action` /
// `closing_action`, never on which strategy produced it.
// =============================================================================

pub mod dedup;
pub mod quality;

pub use dedup::{DropReason, SignalDeduplicator};
pub use quality::{QualityInputs, QualityScorer};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TradeAction;

/// Minimum stop distance as a fraction of entry.
pub const MIN_STOP_FRAC: f64 = 0.003;
/// Minimum target distance as a fraction of entry.
pub const MIN_TARGET_FRAC: f64 = 0.005;

/// Reasons a signal fails its own level invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalLevelError {
    #[error("levels are not ordered for the action")]
    Disordered,
    #[error("stop distance below minimum spread")]
    StopTooTight,
    #[error("target distance below minimum spread")]
    TargetTooTight,
    #[error("entry price must be positive")]
    NonPositiveEntry,
    #[error("quantity must be positive")]
    ZeroQuantity,
}

/// One trade instruction emitted by a strategy or the position monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: TradeAction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub quantity: u32,
    /// Strategy conviction in [0, 10].
    pub confidence: f64,
    pub strategy_id: String,
    pub generated_at: DateTime<Utc>,
    /// Correlation key grouping the parent trade with its protective orders.
    pub tag: String,
    /// Modifies or scales an existing position; bypasses dedup and the gate's
    /// entry checks.
    #[serde(default)]
    pub management_action: bool,
    /// Closes an existing position; implies the same bypass.
    #[serde(default)]
    pub closing_action: bool,
}

impl Signal {
    /// Build an entry signal. Levels are validated by the caller via
    /// [`Signal::validate_levels`] before the pipeline sees it.
    #[allow(clippy::too_many_arguments)]
    pub fn entry(
        symbol: impl Into<String>,
        action: TradeAction,
        entry_price: f64,
        stop_loss: f64,
        target: f64,
        quantity: u32,
        confidence: f64,
        strategy_id: impl Into<String>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            entry_price,
            stop_loss,
            target,
            quantity,
            confidence,
            strategy_id: strategy_id.into(),
            generated_at,
            tag: String::new(),
            management_action: false,
            closing_action: false,
        }
    }

    /// Build a management signal against an existing position. `closing`
    /// marks full exits (square-offs, urgent closures).
    #[allow(clippy::too_many_arguments)]
    pub fn management(
        symbol: impl Into<String>,
        action: TradeAction,
        price: f64,
        quantity: u32,
        strategy_id: impl Into<String>,
        tag: impl Into<String>,
        closing: bool,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            entry_price: price,
            stop_loss: 0.0,
            target: 0.0,
            quantity,
            confidence: 10.0,
            strategy_id: strategy_id.into(),
            generated_at,
            tag: tag.into(),
            management_action: true,
            closing_action: closing,
        }
    }

    /// True when this signal skips the dedup pipeline and the gate's
    /// entry-time checks.
    pub fn bypasses_filters(&self) -> bool {
        self.management_action || self.closing_action
    }

    /// Enforce the level invariants:
    /// BUY requires `stop < entry < target`, SELL the mirror ordering;
    /// the stop must sit at least 0.3% and the target at least 0.5% away.
    /// Management signals carry no protective levels and always pass.
    pub fn validate_levels(&self) -> Result<(), SignalLevelError> {
        if self.quantity == 0 {
            return Err(SignalLevelError::ZeroQuantity);
        }
        if self.bypasses_filters() {
            return Ok(());
        }
        if self.entry_price <= 0.0 {
            return Err(SignalLevelError::NonPositiveEntry);
        }

        let ordered = match self.action {
            TradeAction::Buy => self.stop_loss < self.entry_price && self.entry_price < self.target,
            TradeAction::Sell => {
                self.target < self.entry_price && self.entry_price < self.stop_loss
            }
        };
        if !ordered {
            return Err(SignalLevelError::Disordered);
        }

        let stop_frac = (self.entry_price - self.stop_loss).abs() / self.entry_price;
        if stop_frac < MIN_STOP_FRAC {
            return Err(SignalLevelError::StopTooTight);
        }
        let target_frac = (self.target - self.entry_price).abs() / self.entry_price;
        if target_frac < MIN_TARGET_FRAC {
            return Err(SignalLevelError::TargetTooTight);
        }

        Ok(())
    }

    /// Notional value of the order at its entry price.
    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity as f64
    }

    /// Rupee risk between entry and stop for the full quantity.
    pub fn risk_amount(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs() * self.quantity as f64
    }
}
