//! Fixed worker pool with consistent-hash routing and crash recovery.
//!
//! Workers are spawned up front and must all signal WORKER_READY before the
//! pool reports initialized; partial readiness is a startup failure. Worker
//! ids are stable for the life of the pool, so the hash ring's membership
//! (and every symbol's route) survives crashes: a crashed worker is
//! respawned under the same id with its symbol set preserved, and reloads
//! per-symbol state from the sidecar through WORKER_INIT.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregator::AggregatorStatsSnapshot;
use crate::errors::IngestError;
use crate::models::{Interval, SymbolConfig, Trade};
use crate::pool::messages::{
    Envelope, Priority, TradeBatchResult, WorkerInitConfig, WorkerRequest, WorkerStatusReport,
};
use crate::pool::ring::{ConsistentHashRing, DEFAULT_VNODES_PER_WORKER};
use crate::pool::worker::{run_worker, WorkerContext};
use crate::storage::FootprintFileStore;

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub vnodes_per_worker: usize,
    pub inbox_capacity: usize,
    /// Sidecar socket handed to workers in WORKER_INIT.
    pub socket_path: String,
    pub flush_interval: Duration,
    /// Readiness barrier timeout per spawn attempt.
    pub ready_timeout: Duration,
    pub spawn_attempts: u32,
    pub spawn_backoff_base: Duration,
    pub spawn_backoff_cap: Duration,
    pub max_crashes_in_window: u32,
    pub crash_window: Duration,
    pub rpc_timeout: Duration,
    pub intervals: Vec<Interval>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            vnodes_per_worker: DEFAULT_VNODES_PER_WORKER,
            inbox_capacity: 1_024,
            socket_path: "./flowtrace-sidecar.sock".to_string(),
            flush_interval: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(30),
            spawn_attempts: 3,
            spawn_backoff_base: Duration::from_secs(1),
            spawn_backoff_cap: Duration::from_secs(10),
            max_crashes_in_window: 3,
            crash_window: Duration::from_secs(300),
            rpc_timeout: Duration::from_secs(30),
            intervals: vec![Interval::M1],
        }
    }
}

// =============================================================================
// STATS
// =============================================================================

#[derive(Debug, Default)]
pub struct PoolStats {
    pub messages_sent: AtomicU64,
    pub crashes: AtomicU64,
    pub respawns: AtomicU64,
    pub permanent_failures: AtomicU64,
    pub rpc_timeouts: AtomicU64,
}

impl PoolStats {
    pub fn summary(&self) -> String {
        format!(
            "messages={} crashes={} respawns={} permanent_failures={} rpc_timeouts={}",
            self.messages_sent.load(Ordering::Relaxed),
            self.crashes.load(Ordering::Relaxed),
            self.respawns.load(Ordering::Relaxed),
            self.permanent_failures.load(Ordering::Relaxed),
            self.rpc_timeouts.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// WORKER SLOT
// =============================================================================

struct WorkerSlot {
    urgent_tx: mpsc::Sender<Envelope>,
    normal_tx: mpsc::Sender<Envelope>,
    crash_times: VecDeque<Instant>,
    permanently_failed: bool,
}

// =============================================================================
// POOL
// =============================================================================

pub struct WorkerPool {
    config: PoolConfig,
    store: Arc<FootprintFileStore>,
    slots: RwLock<Vec<WorkerSlot>>,
    ring: RwLock<ConsistentHashRing>,
    /// symbol -> worker id, precomputed from the ring.
    assignments: RwLock<HashMap<String, usize>>,
    symbol_configs: RwLock<HashMap<String, SymbolConfig>>,
    next_correlation: AtomicU64,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    pub stats: PoolStats,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, store: Arc<FootprintFileStore>) -> Arc<Self> {
        let ring = ConsistentHashRing::new(config.vnodes_per_worker);
        Arc::new(Self {
            config,
            store,
            slots: RwLock::new(Vec::new()),
            ring: RwLock::new(ring),
            assignments: RwLock::new(HashMap::new()),
            symbol_configs: RwLock::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            stats: PoolStats::default(),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn next_correlation_id(&self) -> u64 {
        self.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // SPAWNING & READINESS BARRIER
    // -------------------------------------------------------------------------

    /// Spawn every worker and block until all have signalled WORKER_READY.
    /// Any worker that cannot be brought up fails the whole pool.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), IngestError> {
        if self.is_initialized() {
            return Ok(());
        }
        self.shutting_down.store(false, Ordering::SeqCst);
        self.slots.write().clear();

        let mut joins = Vec::with_capacity(self.config.worker_count);
        for worker_id in 0..self.config.worker_count {
            let (slot, join) = self.spawn_worker_with_retry(worker_id).await?;
            self.slots.write().push(slot);
            self.ring.write().add_worker(worker_id);
            joins.push((worker_id, join));
        }

        for (worker_id, join) in joins {
            self.start_monitor(worker_id, join);
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(workers = self.config.worker_count, "worker pool initialized");
        Ok(())
    }

    /// Up to `spawn_attempts` tries with exponential backoff; each attempt
    /// waits for the readiness signal.
    async fn spawn_worker_with_retry(
        self: &Arc<Self>,
        worker_id: usize,
    ) -> Result<(WorkerSlot, JoinHandle<()>), IngestError> {
        let mut backoff = self.config.spawn_backoff_base;
        for attempt in 1..=self.config.spawn_attempts {
            let (urgent_tx, urgent_rx) = mpsc::channel(self.config.inbox_capacity);
            let (normal_tx, normal_rx) = mpsc::channel(self.config.inbox_capacity);
            let (ready_tx, ready_rx) = oneshot::channel();

            let ctx = WorkerContext {
                worker_id,
                store: Arc::clone(&self.store),
                intervals: self.config.intervals.clone(),
            };
            let join = tokio::spawn(run_worker(ctx, urgent_rx, normal_rx, ready_tx));

            match tokio::time::timeout(self.config.ready_timeout, ready_rx).await {
                Ok(Ok(id)) if id == worker_id => {
                    return Ok((
                        WorkerSlot {
                            urgent_tx,
                            normal_tx,
                            crash_times: VecDeque::new(),
                            permanently_failed: false,
                        },
                        join,
                    ));
                }
                _ => {
                    join.abort();
                    warn!(worker_id, attempt, "worker failed readiness; retrying");
                    if attempt < self.config.spawn_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.config.spawn_backoff_cap);
                    }
                }
            }
        }
        Err(IngestError::StartupFailure(format!(
            "worker {worker_id} failed to become ready after {} attempts",
            self.config.spawn_attempts
        )))
    }

    // -------------------------------------------------------------------------
    // CRASH RECOVERY
    // -------------------------------------------------------------------------

    fn start_monitor(self: &Arc<Self>, worker_id: usize, join: JoinHandle<()>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.monitor_worker(worker_id, join).await;
        });
    }

    async fn monitor_worker(self: Arc<Self>, worker_id: usize, mut join: JoinHandle<()>) {
        loop {
            let exit = join.await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            // Any exit outside shutdown is abnormal: a panic, an abort, or a
            // severed inbox all lose the worker's in-memory state.
            self.stats.crashes.fetch_add(1, Ordering::Relaxed);
            match exit {
                Ok(()) => warn!(worker_id, "worker_exited_unexpectedly"),
                Err(e) => warn!(worker_id, panicked = e.is_panic(), "worker_crashed"),
            }

            // Capture the symbol set before any teardown.
            let preserved = self.assigned_symbols(worker_id);

            // Sliding-window crash accounting.
            let now = Instant::now();
            let crashes_in_window = {
                let mut slots = self.slots.write();
                let slot = &mut slots[worker_id];
                slot.crash_times.push_back(now);
                while let Some(front) = slot.crash_times.front() {
                    if now.duration_since(*front) > self.config.crash_window {
                        slot.crash_times.pop_front();
                    } else {
                        break;
                    }
                }
                slot.crash_times.len() as u32
            };

            if crashes_in_window > self.config.max_crashes_in_window {
                self.mark_permanently_failed(worker_id, preserved);
                return;
            }

            // Exponential backoff between respawns.
            let exp = crashes_in_window.saturating_sub(1).min(10);
            let backoff = (self.config.spawn_backoff_base * 2u32.pow(exp))
                .min(self.config.spawn_backoff_cap);
            tokio::time::sleep(backoff).await;

            match self.spawn_worker_with_retry(worker_id).await {
                Ok((new_slot, new_join)) => {
                    // WORKER_INIT goes into the fresh inbox before the lanes
                    // are published, so no trade can overtake it.
                    let init = WorkerInitConfig {
                        socket_path: self.config.socket_path.clone(),
                        assigned_symbols: preserved.clone(),
                        flush_interval: self.config.flush_interval,
                    };
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let envelope = Envelope {
                        correlation_id: self.next_correlation_id(),
                        request: WorkerRequest::WorkerInit {
                            init,
                            reply: reply_tx,
                        },
                    };
                    if new_slot.normal_tx.send(envelope).await.is_err() {
                        self.mark_permanently_failed(worker_id, preserved);
                        error!(worker_id, "respawned worker rejected re-init");
                        return;
                    }

                    {
                        let mut slots = self.slots.write();
                        let slot = &mut slots[worker_id];
                        slot.urgent_tx = new_slot.urgent_tx;
                        slot.normal_tx = new_slot.normal_tx;
                    }
                    self.stats.respawns.fetch_add(1, Ordering::Relaxed);
                    info!(worker_id, symbols = preserved.len(), "worker_respawned");

                    match tokio::time::timeout(self.config.rpc_timeout, reply_rx).await {
                        Ok(Ok(Ok(_))) => {}
                        other => {
                            error!(worker_id, ?other, "worker re-init incomplete");
                        }
                    }
                    join = new_join;
                }
                Err(e) => {
                    self.mark_permanently_failed(worker_id, preserved);
                    error!(worker_id, error = %e, "worker respawn exhausted");
                    return;
                }
            }
        }
    }

    /// Give up on a worker: membership change. Its symbols move to the
    /// surviving workers.
    fn mark_permanently_failed(self: &Arc<Self>, worker_id: usize, orphaned: Vec<SymbolConfig>) {
        self.stats.permanent_failures.fetch_add(1, Ordering::Relaxed);
        {
            let mut slots = self.slots.write();
            slots[worker_id].permanently_failed = true;
        }
        self.ring.write().remove_worker(worker_id);
        error!(
            worker_id,
            orphaned_symbols = orphaned.len(),
            max_crashes = self.config.max_crashes_in_window,
            window_secs = self.config.crash_window.as_secs(),
            "worker permanently failed; crash budget exhausted"
        );

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            for config in orphaned {
                match pool.assign_symbol_to_worker(config.clone()) {
                    Ok(new_worker) => {
                        if let Err(e) = pool.send_worker_init(new_worker).await {
                            error!(symbol = %config.symbol, error = %e, "orphan reassignment init failed");
                        }
                    }
                    Err(e) => {
                        error!(symbol = %config.symbol, error = %e, "orphan reassignment failed")
                    }
                }
            }
        });
    }

    pub fn has_permanent_failures(&self) -> bool {
        self.slots.read().iter().any(|s| s.permanently_failed)
    }

    // -------------------------------------------------------------------------
    // ROUTING
    // -------------------------------------------------------------------------

    /// Deterministic worker for a symbol given the current membership.
    pub fn route(&self, symbol: &str) -> Option<usize> {
        if let Some(worker_id) = self.assignments.read().get(symbol) {
            return Some(*worker_id);
        }
        self.ring.read().route(symbol)
    }

    /// Precompute and record a symbol's route; the actual state assignment
    /// reaches the worker via WORKER_INIT or SYMBOL_ASSIGNMENT.
    pub fn assign_symbol_to_worker(&self, config: SymbolConfig) -> Result<usize, IngestError> {
        let worker_id = self
            .ring
            .read()
            .route(&config.symbol)
            .ok_or_else(|| IngestError::StartupFailure("no workers in ring".to_string()))?;
        self.assignments
            .write()
            .insert(config.symbol.clone(), worker_id);
        self.symbol_configs
            .write()
            .insert(config.symbol.clone(), config);
        Ok(worker_id)
    }

    pub fn unassign_symbol(&self, symbol: &str) -> Option<usize> {
        self.symbol_configs.write().remove(symbol);
        self.assignments.write().remove(symbol)
    }

    /// Every symbol with a precomputed route.
    pub fn routed_symbols(&self) -> Vec<String> {
        self.assignments.read().keys().cloned().collect()
    }

    /// True when the symbol has no route yet (addSymbols idempotence).
    pub fn route_is_new(&self, symbol: &str) -> bool {
        !self.assignments.read().contains_key(symbol)
    }

    pub fn assigned_symbols(&self, worker_id: usize) -> Vec<SymbolConfig> {
        let assignments = self.assignments.read();
        let configs = self.symbol_configs.read();
        assignments
            .iter()
            .filter(|(_, id)| **id == worker_id)
            .filter_map(|(symbol, _)| configs.get(symbol).cloned())
            .collect()
    }

    // -------------------------------------------------------------------------
    // MESSAGING
    // -------------------------------------------------------------------------

    fn lane(&self, worker_id: usize, priority: Priority) -> Result<mpsc::Sender<Envelope>, IngestError> {
        let slots = self.slots.read();
        let slot = slots.get(worker_id).ok_or_else(|| IngestError::WorkerCrash {
            worker_id,
            detail: "unknown worker id".to_string(),
        })?;
        if slot.permanently_failed {
            return Err(IngestError::WorkerCrash {
                worker_id,
                detail: "worker permanently failed".to_string(),
            });
        }
        Ok(match priority {
            Priority::Urgent => slot.urgent_tx.clone(),
            Priority::Normal => slot.normal_tx.clone(),
        })
    }

    /// Send one request and await its reply under the RPC timeout. A timed
    /// out correlation id is abandoned; no state is mutated here.
    async fn request<T>(
        &self,
        worker_id: usize,
        priority: Priority,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerRequest,
    ) -> Result<T, IngestError> {
        let correlation_id = self.next_correlation_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            correlation_id,
            request: build(reply_tx),
        };
        let kind = envelope.request.kind();

        let sender = self.lane(worker_id, priority)?;
        sender.send(envelope).await.map_err(|_| IngestError::WorkerCrash {
            worker_id,
            detail: format!("{kind}: inbox closed"),
        })?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.config.rpc_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(IngestError::WorkerCrash {
                worker_id,
                detail: format!("{kind}: worker dropped reply"),
            }),
            Err(_) => {
                self.stats.rpc_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(IngestError::timeout(
                    format!("worker {worker_id} {kind}"),
                    self.config.rpc_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// PROCESS_TRADES for one symbol's batch.
    pub async fn route_trades(
        &self,
        symbol: &str,
        trades: Vec<Trade>,
        priority: Priority,
    ) -> Result<TradeBatchResult, IngestError> {
        let worker_id = self.route(symbol).ok_or_else(|| {
            IngestError::StartupFailure("no workers available for routing".to_string())
        })?;
        self.request(worker_id, priority, |reply| WorkerRequest::ProcessTrades {
            symbol: symbol.to_string(),
            trades,
            reply,
        })
        .await
    }

    /// WORKER_INIT: socket path plus the worker's current symbol set. Sent
    /// to every worker during startup (even empty ones, to arm their flush
    /// timer) and after each respawn.
    pub async fn send_worker_init(&self, worker_id: usize) -> Result<(), IngestError> {
        let init = WorkerInitConfig {
            socket_path: self.config.socket_path.clone(),
            assigned_symbols: self.assigned_symbols(worker_id),
            flush_interval: self.config.flush_interval,
        };
        self.request(worker_id, Priority::Normal, |reply| WorkerRequest::WorkerInit {
            init,
            reply,
        })
        .await?
        .map(|_| ())
    }

    /// SYMBOL_ASSIGNMENT: dynamic additions and bin-multiplier updates.
    pub async fn send_symbol_assignment(
        &self,
        worker_id: usize,
        configs: Vec<SymbolConfig>,
        revision: u64,
    ) -> Result<(), IngestError> {
        self.request(worker_id, Priority::Normal, |reply| {
            WorkerRequest::SymbolAssignment {
                configs,
                revision,
                reply,
            }
        })
        .await
        .map(|_| ())
    }

    pub async fn drop_symbols(
        &self,
        worker_id: usize,
        symbols: Vec<String>,
    ) -> Result<(), IngestError> {
        self.request(worker_id, Priority::Normal, |reply| WorkerRequest::DropSymbols {
            symbols,
            reply,
        })
        .await
        .map(|_| ())
    }

    pub async fn worker_status(&self, worker_id: usize) -> Result<WorkerStatusReport, IngestError> {
        self.request(worker_id, Priority::Normal, |reply| WorkerRequest::WorkerStatus {
            reply,
        })
        .await
    }

    pub async fn sync_metrics(&self) -> Vec<(usize, AggregatorStatsSnapshot)> {
        let mut out = Vec::new();
        for worker_id in 0..self.config.worker_count {
            if let Ok(snapshot) = self
                .request(worker_id, Priority::Normal, |reply| WorkerRequest::SyncMetrics {
                    reply,
                })
                .await
            {
                out.push((worker_id, snapshot));
            }
        }
        out
    }

    pub async fn heartbeat(&self, worker_id: usize) -> Result<(), IngestError> {
        self.request(worker_id, Priority::Normal, |reply| WorkerRequest::Heartbeat {
            reply,
        })
        .await
        .map(|_| ())
    }

    /// Sever a worker's inboxes so its task exits, simulating a crash for
    /// recovery tests.
    #[cfg(test)]
    fn sever_worker_lanes(&self, worker_id: usize) {
        let (urgent_tx, _urgent_rx) = mpsc::channel(1);
        let (normal_tx, _normal_rx) = mpsc::channel(1);
        let mut slots = self.slots.write();
        slots[worker_id].urgent_tx = urgent_tx;
        slots[worker_id].normal_tx = normal_tx;
    }

    /// Graceful shutdown: every worker flushes to completion before its
    /// SHUTDOWN reply.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for worker_id in 0..self.config.worker_count {
            let result = self
                .request(worker_id, Priority::Normal, |reply| WorkerRequest::Shutdown {
                    reply,
                })
                .await;
            if let Err(e) = result {
                warn!(worker_id, error = %e, "worker shutdown incomplete");
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        info!(stats = %self.stats.summary(), "worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Venue;

    fn test_config(workers: usize, dir: &std::path::Path) -> PoolConfig {
        PoolConfig {
            worker_count: workers,
            socket_path: dir.join("no-sidecar.sock").to_string_lossy().into_owned(),
            flush_interval: Duration::from_secs(3600),
            ready_timeout: Duration::from_secs(5),
            spawn_backoff_base: Duration::from_millis(10),
            spawn_backoff_cap: Duration::from_millis(50),
            rpc_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        }
    }

    fn sym(symbol: &str) -> SymbolConfig {
        SymbolConfig::new(Venue::Binance, symbol, 0.1)
    }

    fn trade(symbol: &str, id: u64, ts: i64) -> Trade {
        Trade {
            venue: Venue::Binance,
            symbol: symbol.to_string(),
            trade_id: id,
            event_time: ts,
            trade_time: ts,
            price: 100.0,
            price_raw: "100.0".to_string(),
            quantity: 1.0,
            is_buyer_maker: false,
        }
    }

    #[tokio::test]
    async fn initialize_readiness_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FootprintFileStore::new(dir.path().join("data")));
        let pool = WorkerPool::new(test_config(4, dir.path()), store);

        pool.initialize().await.unwrap();
        assert!(pool.is_initialized());
        for worker_id in 0..4 {
            pool.heartbeat(worker_id).await.unwrap();
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn routing_is_stable_and_precomputed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FootprintFileStore::new(dir.path().join("data")));
        let pool = WorkerPool::new(test_config(4, dir.path()), store);
        pool.initialize().await.unwrap();

        let w1 = pool.assign_symbol_to_worker(sym("BTCUSDT")).unwrap();
        let w2 = pool.route("BTCUSDT").unwrap();
        assert_eq!(w1, w2);
        // Route is constant across calls.
        for _ in 0..10 {
            assert_eq!(pool.route("BTCUSDT"), Some(w1));
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn trades_processed_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FootprintFileStore::new(dir.path().join("data")));
        let pool = WorkerPool::new(test_config(2, dir.path()), store);
        pool.initialize().await.unwrap();

        let worker_id = pool.assign_symbol_to_worker(sym("BTCUSDT")).unwrap();
        pool.send_worker_init(worker_id).await.unwrap();

        let result = pool
            .route_trades(
                "BTCUSDT",
                vec![trade("BTCUSDT", 1, 1_700_000_000_000), trade("BTCUSDT", 2, 1_700_000_000_100)],
                Priority::Normal,
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.worker_id, worker_id);
        assert_eq!(result.trade_count, 2);

        let status = pool.worker_status(worker_id).await.unwrap();
        assert_eq!(status.stats.trades_processed, 2);
        assert_eq!(status.assigned_symbols, vec!["BTCUSDT".to_string()]);

        let metrics = pool.sync_metrics().await;
        assert_eq!(metrics.len(), 2);
        let total: u64 = metrics.iter().map(|(_, m)| m.trades_processed).sum();
        assert_eq!(total, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn crash_respawn_preserves_route_and_floor() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FootprintFileStore::new(dir.path().join("data")));

        // In-process sidecar so the respawned worker can reload floors.
        let socket = dir.path().join("sidecar.sock").to_string_lossy().into_owned();
        let server = Arc::new(crate::sidecar::SidecarServer::open_in_memory().unwrap());
        let server_path = socket.clone();
        let server_task = tokio::spawn(async move {
            let _ = server.serve(&server_path).await;
        });
        for _ in 0..100 {
            if std::path::Path::new(&socket).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut config = test_config(2, dir.path());
        config.socket_path = socket;
        config.flush_interval = Duration::from_millis(50);
        let pool = WorkerPool::new(config, store);
        pool.initialize().await.unwrap();

        for s in ["AAAUSDT", "BBBUSDT", "CCCUSDT"] {
            pool.assign_symbol_to_worker(sym(s)).unwrap();
        }
        for worker_id in 0..2 {
            pool.send_worker_init(worker_id).await.unwrap();
        }
        let route_before: Vec<Option<usize>> =
            ["AAAUSDT", "BBBUSDT", "CCCUSDT"].iter().map(|s| pool.route(s)).collect();

        let worker_id = pool.route("AAAUSDT").unwrap();
        pool.route_trades("AAAUSDT", vec![trade("AAAUSDT", 10, 1_700_000_000_000)], Priority::Normal)
            .await
            .unwrap();
        // Let the flush timer persist the floor.
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Kill the worker and wait for the monitor to respawn it.
        let respawns_before = pool.stats.respawns.load(Ordering::Relaxed);
        pool.sever_worker_lanes(worker_id);

        for _ in 0..200 {
            if pool.stats.respawns.load(Ordering::Relaxed) > respawns_before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(pool.stats.respawns.load(Ordering::Relaxed) > respawns_before);

        // Same id, same routes.
        let route_after: Vec<Option<usize>> =
            ["AAAUSDT", "BBBUSDT", "CCCUSDT"].iter().map(|s| pool.route(s)).collect();
        assert_eq!(route_before, route_after);

        // The respawned worker reloaded the floor: trade 10 is a duplicate.
        let result = pool
            .route_trades("AAAUSDT", vec![trade("AAAUSDT", 10, 1_700_000_000_000)], Priority::Normal)
            .await
            .unwrap();
        assert!(result.success);
        let status = pool.worker_status(worker_id).await.unwrap();
        assert_eq!(status.stats.duplicates_dropped, 1);

        pool.shutdown().await;
        server_task.abort();
    }
}
