// =============================================================================
// Candle Aggregation
// =============================================================================
//
// Trades are bucketed into tumbling event-time windows per pair.  A window is
// sealed, emitted exactly once and forgotten as soon as the pair's watermark
// (max event time seen minus the lateness tolerance) passes its end.

pub mod candle_aggregator;
pub mod watermark;
pub mod window;

pub use candle_aggregator::{AggregatorConfig, AggregatorProgress, CandleAggregator};
pub use watermark::IdlePolicy;
