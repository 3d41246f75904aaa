// =============================================================================
// PositionMonitor — trailing stops, partial booking, and time-based exits
// =============================================================================
//
// Independent 5-second loop, running even while the orchestrator is degraded.
// Per pass, for every live position:
//
//   1. Price: latest cache tick, broker LTP when stale.
//   2. Trailing stop: at +10% unrealized, trail to lock 50% of profit;
//      modified only when strictly improving. Failures retry next cycle up
//      to a ceiling of 5, then the position is tagged SL_MOD_STUCK.
//   3. Partial booking: first target touch books 50% at market and raises
//      the stop to entry + 0.3 x profit; the second touch flattens.
//   4. Time exits: urgent-close past 15:15 IST, mandatory square-off past
//      15:20 (protective orders cancelled first to avoid double fills).
//   5. Emergency: account unrealized loss at or beyond -3% of capital, or an
//      unprotected position, flattens immediately.
//
// The monitor never mutates position records directly; it issues broker
// commands and feeds observed fills back through the tracker.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, ModifyParams, OrderParams};
use crate::market_data::MarketDataCache;
use crate::portfolio::{FillEvent, Position, PositionTracker};
use crate::session;
use crate::signals::SignalDeduplicator;
use crate::strategy::toolkit;
use crate::types::{OrderType, ProductType, Validity};

/// Stop-modify attempts before a position is declared stuck.
const SL_MOD_CEILING: u32 = 5;

pub struct PositionMonitor {
    broker: Arc<dyn BrokerClient>,
    tracker: Arc<PositionTracker>,
    cache: Arc<MarketDataCache>,
    dedup: Arc<SignalDeduplicator>,

    period: Duration,
    capital: f64,
    emergency_loss_frac: f64,
    urgent_after: NaiveTime,
    mandatory_after: NaiveTime,

    /// Set by `flatten_all()` or by crossing the urgent boundary.
    urgent_close: AtomicBool,
}

impl PositionMonitor {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        tracker: Arc<PositionTracker>,
        cache: Arc<MarketDataCache>,
        dedup: Arc<SignalDeduplicator>,
        config: &crate::config::EngineConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            broker,
            tracker,
            cache,
            dedup,
            period: Duration::from_millis(config.monitor_period_ms),
            capital: config.capital,
            emergency_loss_frac: config.emergency_loss_pct / 100.0,
            urgent_after: session::parse_hhmm(&config.square_off_urgent)?,
            mandatory_after: session::parse_hhmm(&config.square_off_mandatory)?,
            urgent_close: AtomicBool::new(false),
        })
    }

    /// Operator command: URGENT_CLOSE regardless of the clock.
    pub fn flatten_all(&self) {
        warn!("flatten-all commanded — entering urgent close mode");
        self.urgent_close.store(true, Ordering::SeqCst);
    }

    pub fn is_urgent(&self) -> bool {
        self.urgent_close.load(Ordering::SeqCst)
    }

    /// Run until shutdown. With `flatten_on_shutdown` the final act is an
    /// emergency flatten of whatever remains.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        flatten_on_shutdown: bool,
    ) {
        info!(period_ms = self.period.as_millis() as u64, "position monitor started");
        let mut ticker = tokio::time::interval(self.period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if flatten_on_shutdown && !self.tracker.is_empty() {
                        warn!("shutdown with flatten_on_shutdown — flattening remaining positions");
                        self.flatten_everything(Utc::now()).await;
                    }
                    break;
                }
            }
        }
        info!("position monitor stopped");
    }

    // -------------------------------------------------------------------------
    // One evaluation pass (public for the scenario tests)
    // -------------------------------------------------------------------------

    pub async fn scan(&self, now: DateTime<Utc>) {
        let positions = self.tracker.snapshot();
        if positions.is_empty() {
            debug!("monitor: no open positions");
            return;
        }

        // --- Time boundaries --------------------------------------------------
        if session::past_boundary(now, self.urgent_after) {
            if !self.urgent_close.swap(true, Ordering::SeqCst) {
                warn!("urgent square-off boundary crossed — market exits only");
            }
        }
        let mandatory = session::past_boundary(now, self.mandatory_after);

        // --- Account-level emergency -----------------------------------------
        let mut unrealized = 0.0;
        for position in &positions {
            if let Some(price) = self.price_of(&position.symbol).await {
                unrealized += position.unrealized_at(price);
            }
        }
        if unrealized <= -self.emergency_loss_frac * self.capital {
            error!(
                unrealized = format!("{unrealized:.0}"),
                capital = format!("{:.0}", self.capital),
                "EMERGENCY: account loss beyond threshold — flattening all"
            );
            self.flatten_everything(now).await;
            return;
        }

        if mandatory || self.is_urgent() {
            self.flatten_everything(now).await;
            return;
        }

        // --- Per-position management -----------------------------------------
        for position in &positions {
            let Some(price) = self.price_of(&position.symbol).await else {
                warn!(symbol = %position.symbol, "no usable price — skipping this cycle");
                continue;
            };
            self.tracker.note_price(&position.symbol, price);

            // An unprotected position is an emergency candidate.
            if position.unprotected && position.sl_order_id.is_none() {
                error!(symbol = %position.symbol, "unprotected position — flattening immediately");
                self.flatten_position(position, price).await;
                continue;
            }

            // At most one action per position per pass. Once the trail is
            // armed (profit past +10%) it supersedes partial booking: the
            // locked stop protects more than the booking would.
            if self.update_trailing_stop(position, price).await {
                continue;
            }

            // Target touches drive partial booking and the final exit.
            let target_touched = match position.side {
                crate::types::PositionSide::Long => price >= position.target,
                crate::types::PositionSide::Short => price <= position.target,
            };
            if target_touched {
                if position.partial_booked {
                    info!(symbol = %position.symbol, price, "second target touch — flattening remainder");
                    self.flatten_position(position, price).await;
                } else {
                    self.book_partial(position, price).await;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Trailing
    // -------------------------------------------------------------------------

    /// Returns `true` when a trail candidate applied this pass (whether or
    /// not the broker accepted it; a failure retries next cycle).
    async fn update_trailing_stop(&self, position: &Position, price: f64) -> bool {
        if position.sl_mod_stuck {
            return false;
        }
        let Some(trail) = toolkit::trail_stop(position.entry_price, price, position.side) else {
            return false;
        };
        if !toolkit::improves_stop(position.stop_loss, trail, position.side) {
            return false;
        }
        let Some(sl_order_id) = position.sl_order_id.as_deref() else {
            return false;
        };
        let trail = self
            .cache
            .meta(&position.symbol)
            .map(|m| m.round_to_tick(trail))
            .unwrap_or(trail);

        match self
            .broker
            .modify_order(
                sl_order_id,
                &ModifyParams {
                    trigger_price: Some(trail),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(()) => {
                info!(
                    symbol = %position.symbol,
                    old_stop = position.stop_loss,
                    new_stop = trail,
                    "trailing stop raised"
                );
                self.tracker.modify_sl(&position.symbol, trail, None);
            }
            Err(e) => {
                // Keep the improvement for the next cycle; never lose it.
                let attempts = self
                    .tracker
                    .record_sl_mod_failure(&position.symbol, SL_MOD_CEILING);
                warn!(
                    symbol = %position.symbol,
                    attempts,
                    error = %e,
                    "stop modify failed — will retry next cycle"
                );
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Partial booking
    // -------------------------------------------------------------------------

    async fn book_partial(&self, position: &Position, price: f64) {
        let book_qty = self.lot_aligned(&position.symbol, position.quantity / 2);
        if book_qty == 0 || book_qty >= position.quantity {
            // Cannot split into lots; treat the touch as a full exit.
            self.flatten_position(position, price).await;
            return;
        }

        match self
            .place_market_exit(position, book_qty, format!("{}:PB", position.tag))
            .await
        {
            Ok(_) => {
                let new_stop = toolkit::partial_booking_stop(
                    position.entry_price,
                    price,
                    position.side,
                );
                let new_stop = self
                    .cache
                    .meta(&position.symbol)
                    .map(|m| m.round_to_tick(new_stop))
                    .unwrap_or(new_stop);

                self.tracker
                    .mark_partial(&position.symbol, book_qty, price, new_stop);

                // Shrink the resting stop order to the remainder and raise
                // its trigger; the target stays in place for the second
                // touch.
                if let Some(sl_order_id) = position.sl_order_id.as_deref() {
                    let remaining = position.quantity - book_qty;
                    if let Err(e) = self
                        .broker
                        .modify_order(
                            sl_order_id,
                            &ModifyParams {
                                quantity: Some(remaining),
                                trigger_price: Some(new_stop),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        warn!(symbol = %position.symbol, error = %e, "post-partial stop modify failed");
                        self.tracker
                            .record_sl_mod_failure(&position.symbol, SL_MOD_CEILING);
                    }
                }

                info!(
                    symbol = %position.symbol,
                    booked = book_qty,
                    price,
                    new_stop,
                    "partial booking executed"
                );
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "partial booking order failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Flattening
    // -------------------------------------------------------------------------

    async fn flatten_everything(&self, _now: DateTime<Utc>) {
        for position in self.tracker.snapshot() {
            let price = self
                .price_of(&position.symbol)
                .await
                .unwrap_or(position.entry_price);
            self.flatten_position(&position, price).await;
        }
    }

    /// Cancel protective children first (avoiding double fills), then close
    /// the position at market and apply the fill to the tracker.
    async fn flatten_position(&self, position: &Position, price: f64) {
        for order_id in [&position.sl_order_id, &position.target_order_id]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.broker.cancel_order(order_id).await {
                // Already-terminal protective orders are fine to skip.
                debug!(symbol = %position.symbol, order_id = %order_id, error = %e, "protective cancel skipped");
            }
        }

        match self
            .place_market_exit(position, position.quantity, format!("{}:SQ", position.tag))
            .await
        {
            Ok(order_id) => {
                self.tracker.update(&FillEvent {
                    order_id,
                    symbol: position.symbol.clone(),
                    action: position.side.exit_action(),
                    quantity: position.quantity,
                    price,
                });
                let pnl = position.unrealized_at(price);
                self.dedup.record_outcome(&position.strategy_id, pnl > 0.0);
                info!(
                    symbol = %position.symbol,
                    qty = position.quantity,
                    price,
                    pnl = format!("{pnl:.2}"),
                    "position flattened"
                );
            }
            Err(e) => {
                error!(symbol = %position.symbol, error = %e, "flatten order failed — will retry next cycle");
            }
        }
    }

    async fn place_market_exit(
        &self,
        position: &Position,
        quantity: u32,
        tag: String,
    ) -> Result<String, crate::broker::BrokerError> {
        let exchange = self
            .cache
            .meta(&position.symbol)
            .map(|m| m.segment.exchange().to_string())
            .unwrap_or_else(|| "NSE".to_string());

        self.broker
            .place_order(&OrderParams {
                symbol: position.symbol.clone(),
                exchange,
                transaction_type: position.side.exit_action(),
                order_type: OrderType::Market,
                quantity,
                product: ProductType::Mis,
                validity: Validity::Day,
                price: None,
                trigger_price: None,
                tag,
                client_order_id: Uuid::new_v4().to_string(),
            })
            .await
    }

    // -------------------------------------------------------------------------
    // Price sourcing
    // -------------------------------------------------------------------------

    /// Latest fresh tick, falling back to the broker LTP when the cache is
    /// stale.
    async fn price_of(&self, symbol: &str) -> Option<f64> {
        if let Some(tick) = self.cache.fresh(symbol) {
            return Some(tick.ltp);
        }
        let quotes = self.broker.ltp(&[symbol.to_string()]).await.ok()?;
        quotes.get(symbol).copied()
    }

    fn lot_aligned(&self, symbol: &str, quantity: u32) -> u32 {
        self.cache
            .meta(symbol)
            .map(|m| m.round_to_lot(quantity))
            .unwrap_or(quantity)
    }
}

impl std::fmt::Debug for PositionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionMonitor")
            .field("period", &self.period)
            .field("urgent_close", &self.is_urgent())
            .finish()
    }
}
