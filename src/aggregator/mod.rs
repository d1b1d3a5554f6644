//! Footprint candle aggregation: the per-symbol state machine and the
//! bin-multiplier tier table.

pub mod footprint;
pub mod tiers;

pub use footprint::{
    AggregatorStats, AggregatorStatsSnapshot, ApplyResult, FootprintAggregator, TradeOutcome,
};
pub use tiers::{multiplier_for_price, MULTIPLIER_LADDER};
