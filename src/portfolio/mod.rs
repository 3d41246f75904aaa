// =============================================================================
// Portfolio layer — position truth and exposure gating
// =============================================================================

pub mod gate;
pub mod tracker;

pub use gate::{GateContext, GateDecision, GateReason, PortfolioGate};
pub use tracker::{FillEvent, Position, PositionTracker};
