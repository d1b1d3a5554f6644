//! Flowtrace backend: live trade ingestion, sharded footprint candle
//! aggregation, append-only period file storage and the paginated query API.

pub mod aggregator;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod pool;
pub mod sidecar;
pub mod storage;
pub mod venue;

pub use errors::{IngestError, IngestResult};
pub use models::{
    AppConfig, FootprintCandle, Interval, PriceBin, SymbolConfig, SymbolStatus, Trade, TradeGap,
    Venue,
};
pub use orchestrator::{HealthMetrics, IngestionOrchestrator, IngestionState};
pub use storage::{FootprintFileStore, PaginatedCandles, StoreQuery};
