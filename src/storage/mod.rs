//! On-disk candle persistence: calendar partitioning, record codecs, the
//! period file container and the append-only store.

pub mod codec;
pub mod file_store;
pub mod partition;
pub mod period_file;

pub use codec::{validate, CandleRecord, DecodedRecord, FootprintRecord};
pub use file_store::{
    DataKind, FootprintFileStore, IndexFile, PaginatedCandles, SaveOutcome, StoreQuery, StoreStats,
};
pub use partition::{partition_for, periods_in_range, Partition, PeriodPattern};
pub use period_file::{PeriodFileHeader, HEADER_SIZE};
