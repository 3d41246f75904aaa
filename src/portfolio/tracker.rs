// =============================================================================
// PositionTracker — in-memory truth of live positions
// =============================================================================
//
// Owns every `Position` object; all mutation goes through this API. The
// orchestrator, strategies, and the monitor observe by copy. Reconciliation
// against the broker runs periodically: on divergence the broker wins and a
// telemetry event flags the delta. Reconciliation never creates protective
// orders; it only adjusts quantities and surfaces divergence.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::BrokerPosition;
use crate::types::{InstrumentKind, PositionSide, TradeAction};

/// A live position and its order lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Remaining open quantity, reduced on partial booking.
    pub quantity: u32,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: f64,
    pub target: f64,
    pub kind: InstrumentKind,
    /// Broker id of the entry order.
    pub entry_order_id: String,
    #[serde(default)]
    pub sl_order_id: Option<String>,
    #[serde(default)]
    pub target_order_id: Option<String>,
    #[serde(default)]
    pub partial_booked: bool,
    /// Best price seen in the position's favour since entry.
    pub max_favorable_excursion: f64,
    pub strategy_id: String,
    pub tag: String,
    /// Set when a protective order could not be confirmed after entry fill.
    #[serde(default)]
    pub unprotected: bool,
    /// Consecutive stop-modify failures; at the ceiling the monitor tags the
    /// position stuck and stops retrying.
    #[serde(default)]
    pub sl_mod_attempts: u32,
    #[serde(default)]
    pub sl_mod_stuck: bool,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity as f64
    }

    /// Signed unrealized PnL at `price`.
    pub fn unrealized_at(&self, price: f64) -> f64 {
        self.side.direction() * (price - self.entry_price) * self.quantity as f64
    }

    /// Fractional profit at `price`, positive when in favour.
    pub fn profit_frac_at(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.direction() * (price - self.entry_price) / self.entry_price
    }

    /// Whether this position still lacks a confirmed stop order and has not
    /// been tagged stuck.
    pub fn needs_protection(&self) -> bool {
        self.sl_order_id.is_none() && !self.sl_mod_stuck
    }
}

/// A fill observed from the broker, applied via [`PositionTracker::update`].
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub order_id: String,
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: u32,
    pub price: f64,
}

/// Divergence surfaced by reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum Divergence {
    /// Broker reports a position the tracker does not know ("phantom").
    Phantom { symbol: String, net_quantity: i64 },
    /// Quantities disagree; tracker adopted the broker's.
    QuantityAdjusted {
        symbol: String,
        local: u32,
        broker: u32,
    },
    /// Broker says flat; the local position was dropped.
    ClosedAtBroker { symbol: String },
}

/// Thread-safe owner of all live positions, keyed by symbol (one net
/// position per symbol).
pub struct PositionTracker {
    positions: RwLock<HashMap<String, Position>>,
    /// Realized PnL accumulated today, fed by closes and partial bookings.
    realized_today: RwLock<f64>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            realized_today: RwLock::new(0.0),
        }
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Record a freshly opened position.
    pub fn add(&self, position: Position) {
        info!(
            symbol = %position.symbol,
            side = %position.side,
            qty = position.quantity,
            entry = position.entry_price,
            tag = %position.tag,
            "position added"
        );
        self.positions
            .write()
            .insert(position.symbol.clone(), position);
    }

    /// Apply an observed fill. Fills in the position's direction are ignored
    /// (entries are recorded via `add`); opposite fills reduce the quantity
    /// and remove the position when it reaches zero.
    pub fn update(&self, fill: &FillEvent) {
        let mut positions = self.positions.write();
        let Some(position) = positions.get_mut(&fill.symbol) else {
            return;
        };
        if fill.action == position.side.entry_action() {
            return;
        }

        let closed = fill.quantity.min(position.quantity);
        let pnl = position.side.direction()
            * (fill.price - position.entry_price)
            * closed as f64;
        *self.realized_today.write() += pnl;

        info!(
            symbol = %fill.symbol,
            order_id = %fill.order_id,
            closed_qty = closed,
            pnl = format!("{pnl:.2}"),
            "exit fill applied"
        );

        if closed >= position.quantity {
            positions.remove(&fill.symbol);
        } else {
            position.quantity -= closed;
        }
    }

    /// Install a new stop level and (optionally) a replacement stop order id.
    /// Resets the failure counter.
    pub fn modify_sl(&self, symbol: &str, new_sl: f64, new_order_id: Option<String>) {
        let mut positions = self.positions.write();
        if let Some(position) = positions.get_mut(symbol) {
            position.stop_loss = new_sl;
            if let Some(id) = new_order_id {
                position.sl_order_id = Some(id);
            }
            position.sl_mod_attempts = 0;
            position.sl_mod_stuck = false;
            position.unprotected = position.sl_order_id.is_none();
        }
    }

    /// Flag the first profit-target booking: reduce quantity, raise the stop,
    /// and remember that the next target touch flattens.
    pub fn mark_partial(&self, symbol: &str, booked_quantity: u32, booked_price: f64, new_stop: f64) {
        let mut positions = self.positions.write();
        let Some(position) = positions.get_mut(symbol) else {
            return;
        };
        let booked = booked_quantity.min(position.quantity);
        let pnl = position.side.direction()
            * (booked_price - position.entry_price)
            * booked as f64;
        *self.realized_today.write() += pnl;

        position.quantity -= booked;
        position.partial_booked = true;
        position.stop_loss = new_stop;

        info!(
            symbol,
            booked_qty = booked,
            remaining = position.quantity,
            new_stop,
            pnl = format!("{pnl:.2}"),
            "partial booking recorded"
        );

        if position.quantity == 0 {
            positions.remove(symbol);
        }
    }

    /// Remove a position outright (post-flatten confirmation).
    pub fn remove(&self, symbol: &str) -> Option<Position> {
        self.positions.write().remove(symbol)
    }

    /// Track the best favourable price seen, for trailing decisions.
    pub fn note_price(&self, symbol: &str, price: f64) {
        let mut positions = self.positions.write();
        if let Some(position) = positions.get_mut(symbol) {
            let better = match position.side {
                PositionSide::Long => price > position.max_favorable_excursion,
                PositionSide::Short => price < position.max_favorable_excursion,
            };
            if better {
                position.max_favorable_excursion = price;
            }
        }
    }

    pub fn mark_unprotected(&self, symbol: &str) {
        if let Some(position) = self.positions.write().get_mut(symbol) {
            position.unprotected = true;
        }
    }

    /// Record one failed stop-modify attempt; returns the new attempt count
    /// and sets the stuck flag at `ceiling`.
    pub fn record_sl_mod_failure(&self, symbol: &str, ceiling: u32) -> u32 {
        let mut positions = self.positions.write();
        let Some(position) = positions.get_mut(symbol) else {
            return 0;
        };
        position.sl_mod_attempts += 1;
        if position.sl_mod_attempts >= ceiling && !position.sl_mod_stuck {
            position.sl_mod_stuck = true;
            warn!(symbol, attempts = position.sl_mod_attempts, "stop modify stuck");
        }
        position.sl_mod_attempts
    }

    pub fn record_realized(&self, pnl: f64) {
        *self.realized_today.write() += pnl;
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    /// Immutable copy of all live positions.
    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }

    pub fn realized_today(&self) -> f64 {
        *self.realized_today.read()
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Compare against the broker's view. The broker wins every divergence;
    /// the returned list is the telemetry of what changed.
    pub fn reconcile(&self, broker_positions: &[BrokerPosition]) -> Vec<Divergence> {
        let mut divergences = Vec::new();
        let mut positions = self.positions.write();

        let broker_by_symbol: HashMap<&str, &BrokerPosition> = broker_positions
            .iter()
            .map(|p| (p.symbol.as_str(), p))
            .collect();

        // Local positions the broker disagrees with.
        let symbols: Vec<String> = positions.keys().cloned().collect();
        for symbol in symbols {
            let local_qty = positions[&symbol].quantity;
            match broker_by_symbol.get(symbol.as_str()) {
                None => {
                    warn!(symbol = %symbol, "position closed at broker — dropping local copy");
                    positions.remove(&symbol);
                    divergences.push(Divergence::ClosedAtBroker { symbol });
                }
                Some(broker) => {
                    let broker_qty = broker.net_quantity.unsigned_abs() as u32;
                    if broker_qty == 0 {
                        positions.remove(&symbol);
                        divergences.push(Divergence::ClosedAtBroker { symbol });
                    } else if broker_qty != local_qty {
                        warn!(
                            symbol = %symbol,
                            local = local_qty,
                            broker = broker_qty,
                            "quantity divergence — broker wins"
                        );
                        if let Some(position) = positions.get_mut(&symbol) {
                            position.quantity = broker_qty;
                        }
                        divergences.push(Divergence::QuantityAdjusted {
                            symbol,
                            local: local_qty,
                            broker: broker_qty,
                        });
                    }
                }
            }
        }

        // Broker positions unknown locally: surfaced, never auto-adopted with
        // protective orders.
        for broker in broker_positions {
            if broker.net_quantity != 0 && !positions.contains_key(&broker.symbol) {
                warn!(
                    symbol = %broker.symbol,
                    net_qty = broker.net_quantity,
                    "phantom position at broker"
                );
                divergences.push(Divergence::Phantom {
                    symbol: broker.symbol.clone(),
                    net_quantity: broker.net_quantity,
                });
            }
        }

        divergences
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("positions", &self.positions.read().len())
            .field("realized_today", &*self.realized_today.read())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn long_position(symbol: &str, qty: u32, entry: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity: qty,
            entry_price: entry,
            entry_time: Utc::now(),
            stop_loss: entry * 0.99,
            target: entry * 1.02,
            kind: InstrumentKind::Equity,
            entry_order_id: "E1".to_string(),
            sl_order_id: Some("S1".to_string()),
            target_order_id: Some("T1".to_string()),
            partial_booked: false,
            max_favorable_excursion: entry,
            strategy_id: "momentum".to_string(),
            tag: "momentum:abc".to_string(),
            unprotected: false,
            sl_mod_attempts: 0,
            sl_mod_stuck: false,
        }
    }

    #[test]
    fn exit_fill_reduces_then_removes() {
        let tracker = PositionTracker::new();
        tracker.add(long_position("RELIANCE", 10, 2500.0));

        tracker.update(&FillEvent {
            order_id: "X1".to_string(),
            symbol: "RELIANCE".to_string(),
            action: TradeAction::Sell,
            quantity: 4,
            price: 2520.0,
        });
        assert_eq!(tracker.get("RELIANCE").unwrap().quantity, 6);
        assert!((tracker.realized_today() - 80.0).abs() < 1e-9);

        tracker.update(&FillEvent {
            order_id: "X2".to_string(),
            symbol: "RELIANCE".to_string(),
            action: TradeAction::Sell,
            quantity: 6,
            price: 2510.0,
        });
        assert!(tracker.get("RELIANCE").is_none());
    }

    #[test]
    fn same_direction_fill_ignored() {
        let tracker = PositionTracker::new();
        tracker.add(long_position("RELIANCE", 10, 2500.0));
        tracker.update(&FillEvent {
            order_id: "X1".to_string(),
            symbol: "RELIANCE".to_string(),
            action: TradeAction::Buy,
            quantity: 5,
            price: 2510.0,
        });
        assert_eq!(tracker.get("RELIANCE").unwrap().quantity, 10);
    }

    #[test]
    fn partial_booking_updates_stop_and_quantity() {
        let tracker = PositionTracker::new();
        tracker.add(long_position("RELIANCE", 10, 2500.0));
        tracker.mark_partial("RELIANCE", 5, 2550.0, 2515.0);

        let position = tracker.get("RELIANCE").unwrap();
        assert_eq!(position.quantity, 5);
        assert!(position.partial_booked);
        assert!((position.stop_loss - 2515.0).abs() < 1e-9);
        assert!((tracker.realized_today() - 250.0).abs() < 1e-9);
    }

    #[test]
    fn modify_sl_resets_failure_state() {
        let tracker = PositionTracker::new();
        let mut position = long_position("RELIANCE", 10, 2500.0);
        position.sl_mod_attempts = 3;
        tracker.add(position);

        tracker.modify_sl("RELIANCE", 2490.0, Some("S2".to_string()));
        let position = tracker.get("RELIANCE").unwrap();
        assert!((position.stop_loss - 2490.0).abs() < 1e-9);
        assert_eq!(position.sl_order_id.as_deref(), Some("S2"));
        assert_eq!(position.sl_mod_attempts, 0);
        assert!(!position.sl_mod_stuck);
    }

    #[test]
    fn sl_mod_failures_hit_ceiling() {
        let tracker = PositionTracker::new();
        tracker.add(long_position("RELIANCE", 10, 2500.0));

        for _ in 0..4 {
            tracker.record_sl_mod_failure("RELIANCE", 5);
        }
        assert!(!tracker.get("RELIANCE").unwrap().sl_mod_stuck);
        tracker.record_sl_mod_failure("RELIANCE", 5);
        assert!(tracker.get("RELIANCE").unwrap().sl_mod_stuck);
    }

    #[test]
    fn reconcile_broker_wins() {
        let tracker = PositionTracker::new();
        tracker.add(long_position("RELIANCE", 10, 2500.0));
        tracker.add(long_position("INFY", 20, 1500.0));

        let broker = vec![
            BrokerPosition {
                symbol: "RELIANCE".to_string(),
                net_quantity: 6,
                average_price: 2500.0,
                pnl: 0.0,
            },
            BrokerPosition {
                symbol: "TCS".to_string(),
                net_quantity: 5,
                average_price: 3500.0,
                pnl: 0.0,
            },
        ];

        let divergences = tracker.reconcile(&broker);

        // INFY dropped, RELIANCE adjusted, TCS phantom-flagged (not adopted).
        assert_eq!(tracker.get("RELIANCE").unwrap().quantity, 6);
        assert!(tracker.get("INFY").is_none());
        assert!(tracker.get("TCS").is_none());
        assert_eq!(divergences.len(), 3);
        assert!(divergences.contains(&Divergence::ClosedAtBroker {
            symbol: "INFY".to_string()
        }));
        assert!(divergences.contains(&Divergence::Phantom {
            symbol: "TCS".to_string(),
            net_quantity: 5
        }));
    }

    #[test]
    fn note_price_tracks_mfe_directionally() {
        let tracker = PositionTracker::new();
        tracker.add(long_position("RELIANCE", 10, 2500.0));
        tracker.note_price("RELIANCE", 2550.0);
        tracker.note_price("RELIANCE", 2530.0);
        assert!((tracker.get("RELIANCE").unwrap().max_favorable_excursion - 2550.0).abs() < 1e-9);
    }
}
