// =============================================================================
// Shared types used across the Vajra trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Exchange segment a symbol trades in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    /// NSE cash equities.
    EqNse,
    /// NFO futures & options.
    FoNfo,
}

impl Segment {
    /// Exchange code expected by the broker API.
    pub fn exchange(self) -> &'static str {
        match self {
            Self::EqNse => "NSE",
            Self::FoNfo => "NFO",
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.exchange())
    }
}

/// What kind of instrument a symbol is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    Equity,
    Future,
    IndexOption,
    StockOption,
}

impl InstrumentKind {
    pub fn is_option(self) -> bool {
        matches!(self, Self::IndexOption | Self::StockOption)
    }
}

/// Direction of a trade instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    /// The action that flattens a position opened with `self`.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Side of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Action that opened this side.
    pub fn entry_action(self) -> TradeAction {
        match self {
            Self::Long => TradeAction::Buy,
            Self::Short => TradeAction::Sell,
        }
    }

    /// Action that closes this side.
    pub fn exit_action(self) -> TradeAction {
        self.entry_action().opposite()
    }

    /// +1.0 for long, -1.0 for short. Multiplying a price move by this gives
    /// the signed PnL direction.
    pub fn direction(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl From<TradeAction> for PositionSide {
    fn from(action: TradeAction) -> Self {
        match action {
            TradeAction::Buy => Self::Long,
            TradeAction::Sell => Self::Short,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Order types supported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    StopLossMarket,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::StopLoss => write!(f, "SL"),
            Self::StopLossMarket => write!(f, "SL-M"),
        }
    }
}

/// Broker product type. All intraday flow uses MIS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    Mis,
    Nrml,
}

impl std::fmt::Display for ProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mis => write!(f, "MIS"),
            Self::Nrml => write!(f, "NRML"),
        }
    }
}

/// Order validity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    Day,
    Ioc,
}

impl std::fmt::Display for Validity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "DAY"),
            Self::Ioc => write!(f, "IOC"),
        }
    }
}

/// Broker-reported order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    Triggered,
    Complete,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Open => write!(f, "OPEN"),
            Self::Triggered => write!(f, "TRIGGERED"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Static contract data for a tradeable symbol. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub symbol: String,
    pub segment: Segment,
    pub kind: InstrumentKind,
    /// Minimum tradeable quantity multiple. 1 for cash equities.
    pub lot_size: u32,
    /// Minimum price increment.
    pub tick_size: f64,
}

impl SymbolMeta {
    /// Cash equity contract with lot size 1 and the standard 5 paise tick.
    pub fn equity(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            segment: Segment::EqNse,
            kind: InstrumentKind::Equity,
            lot_size: 1,
            tick_size: 0.05,
        }
    }

    /// NFO option contract.
    pub fn option(symbol: impl Into<String>, kind: InstrumentKind, lot_size: u32) -> Self {
        Self {
            symbol: symbol.into(),
            segment: Segment::FoNfo,
            kind,
            lot_size,
            tick_size: 0.05,
        }
    }

    /// Round a raw price to the nearest valid tick.
    pub fn round_to_tick(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }

    /// Round a raw quantity down to a whole number of lots. Returns 0 when
    /// the quantity cannot cover a single lot.
    pub fn round_to_lot(&self, quantity: u32) -> u32 {
        if self.lot_size <= 1 {
            return quantity;
        }
        (quantity / self.lot_size) * self.lot_size
    }
}

/// Whether the engine loop is live, degraded, or stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Running,
    NotReady,
    Stopped,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::NotReady => write!(f, "NOT_READY"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}
