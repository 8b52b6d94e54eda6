// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the rolling indicators computed
// over each pair's candle history, plus the registry that maps configured
// names to them and the stateful calculator that drives them per candle.
// Every indicator function returns `Option`/empty output on insufficient data
// so a missing value is never reported as zero.

pub mod atr;
pub mod bollinger;
pub mod calculator;
pub mod ema;
pub mod history;
pub mod macd;
pub mod obv;
pub mod registry;
pub mod roc;
pub mod rsi;
pub mod sma;

pub use calculator::{IndicatorCalculator, IndicatorProgress};
pub use registry::parse_set;
