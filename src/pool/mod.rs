//! Sharded worker pool: consistent-hash routing, the worker event loop and
//! crash recovery with symbol preservation.

pub mod messages;
pub mod pool;
pub mod ring;
pub mod worker;

pub use messages::{Envelope, Priority, TradeBatchResult, WorkerRequest, WorkerStatusReport};
pub use pool::{PoolConfig, PoolStats, WorkerPool};
pub use ring::{ConsistentHashRing, DEFAULT_VNODES_PER_WORKER};
pub use worker::WorkerContext;
