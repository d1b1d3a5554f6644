//! Worker inbox messages.
//!
//! Every request carries a correlation id that the reply echoes. Workers
//! drain urgent messages before normal ones; within a lane the inbox is
//! strictly FIFO.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::aggregator::AggregatorStatsSnapshot;
use crate::errors::IngestError;
use crate::models::{SymbolConfig, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    /// Recovered trades jump ahead of the normal lane.
    Urgent,
}

/// Result of a PROCESS_TRADES request.
#[derive(Debug, Clone)]
pub struct TradeBatchResult {
    pub correlation_id: u64,
    pub success: bool,
    pub worker_id: usize,
    pub trade_count: usize,
    pub candles_completed: usize,
    pub processing_time: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerStatusReport {
    pub correlation_id: u64,
    pub worker_id: usize,
    pub assigned_symbols: Vec<String>,
    pub dirty_symbols: usize,
    pub sidecar_connected: bool,
    pub stats: AggregatorStatsSnapshot,
}

/// Payload of WORKER_INIT: everything a (re)spawned worker needs before its
/// first trade.
#[derive(Debug, Clone)]
pub struct WorkerInitConfig {
    pub socket_path: String,
    pub assigned_symbols: Vec<SymbolConfig>,
    pub flush_interval: Duration,
}

#[derive(Debug)]
pub enum WorkerRequest {
    ProcessTrades {
        symbol: String,
        trades: Vec<Trade>,
        reply: oneshot::Sender<TradeBatchResult>,
    },
    SymbolAssignment {
        configs: Vec<SymbolConfig>,
        revision: u64,
        reply: oneshot::Sender<u64>,
    },
    WorkerInit {
        init: WorkerInitConfig,
        reply: oneshot::Sender<Result<u64, IngestError>>,
    },
    WorkerStatus {
        reply: oneshot::Sender<WorkerStatusReport>,
    },
    SyncMetrics {
        reply: oneshot::Sender<AggregatorStatsSnapshot>,
    },
    Heartbeat {
        reply: oneshot::Sender<u64>,
    },
    /// Flush the named symbols, then drop their state.
    DropSymbols {
        symbols: Vec<String>,
        reply: oneshot::Sender<u64>,
    },
    /// Flush everything and stop. The reply is sent after flush_all has run
    /// to completion.
    Shutdown {
        reply: oneshot::Sender<u64>,
    },
}

impl WorkerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProcessTrades { .. } => "PROCESS_TRADES",
            Self::SymbolAssignment { .. } => "SYMBOL_ASSIGNMENT",
            Self::WorkerInit { .. } => "WORKER_INIT",
            Self::WorkerStatus { .. } => "WORKER_STATUS",
            Self::SyncMetrics { .. } => "SYNC_METRICS",
            Self::Heartbeat { .. } => "HEARTBEAT",
            Self::DropSymbols { .. } => "DROP_SYMBOLS",
            Self::Shutdown { .. } => "SHUTDOWN",
        }
    }
}

/// One inbox message.
#[derive(Debug)]
pub struct Envelope {
    pub correlation_id: u64,
    pub request: WorkerRequest,
}
