// =============================================================================
// Indicators Module
// =============================================================================
//
// Pure numeric building blocks for the strategies. Everything here operates
// on plain slices, carries its own input guards, and never touches I/O —
// strategies stay pure because their inputs already are.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod roc;
pub mod rsi;

pub use atr::average_true_range;
pub use bollinger::{bollinger_bands, BollingerBands};
pub use ema::ema_series;
pub use roc::rate_of_change;
pub use rsi::relative_strength_index;
