// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator implementations. Every public function
// returns `Option<T>` or an empty series so callers are forced to handle
// insufficient-data and numerical edge cases.

pub mod atr;
pub mod ema;
pub mod hp_filter;
pub mod macd;
pub mod roc;
pub mod rsi;

pub use atr::calculate_atr;
pub use ema::calculate_ema;
pub use hp_filter::hp_trend;
pub use macd::{calculate_macd, MacdPoint};
pub use roc::calculate_roc;
pub use rsi::calculate_rsi;
