//! Ingestion orchestrator.
//!
//! Boot order is fixed: the worker pool initializes and passes its readiness
//! barrier, symbol routing is precomputed and delivered through WORKER_INIT,
//! the trade callback is registered, and only then do venue streams connect.
//! Routing is therefore always ready before the first trade arrives.
//!
//! The fan-out preserves per-symbol ordering with one in-flight batch per
//! symbol: trades arriving while a batch is outstanding are buffered, sorted
//! by id, and drained FIFO when the batch completes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::IngestError;
use crate::models::{AppConfig, SymbolConfig, Trade, Venue};
use crate::pool::{Priority, WorkerPool};
use crate::sidecar::{SidecarClient, SidecarSupervisor, SupervisorStatus};
use crate::storage::FootprintFileStore;
use crate::venue::{RestGapClient, RestGapConfig, SymbolConfigRepository, VenueConnector};

const GAP_RECOVERY_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// STATE & METRICS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionState {
    Stopped,
    Starting,
    Running,
    /// No active symbols yet; routing initializes on the first addSymbols.
    Standby,
    Stopping,
}

impl std::fmt::Display for IngestionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Standby => "STANDBY",
            Self::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
pub struct OrchestratorStats {
    pub trades_received: AtomicU64,
    pub batches_dispatched: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub gaps_recovered: AtomicU64,
    pub recovered_trades_routed: AtomicU64,
}

impl OrchestratorStats {
    pub fn summary(&self) -> String {
        format!(
            "trades={} batches={} dispatch_failures={} gaps_recovered={} recovered_trades={}",
            self.trades_received.load(Ordering::Relaxed),
            self.batches_dispatched.load(Ordering::Relaxed),
            self.dispatch_failures.load(Ordering::Relaxed),
            self.gaps_recovered.load(Ordering::Relaxed),
            self.recovered_trades_routed.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorHealth {
    pub venue: String,
    pub state: String,
    pub streams: usize,
    pub frames_received: u64,
    pub trades_decoded: u64,
    pub reconnections: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub state: String,
    pub healthy: bool,
    pub worker_count: usize,
    pub pool_initialized: bool,
    pub pool_permanent_failures: bool,
    pub active_symbols: usize,
    pub trades_received: u64,
    pub connectors: Vec<ConnectorHealth>,
    pub sidecar_status: String,
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

pub struct IngestionOrchestrator {
    config: AppConfig,
    repo: Arc<dyn SymbolConfigRepository>,
    pool: Arc<WorkerPool>,
    store: Arc<FootprintFileStore>,
    /// Managed sidecar process; None when the sidecar runs externally.
    supervisor: Option<Arc<SidecarSupervisor>>,
    gap_reader: SidecarClient,
    connectors: RwLock<HashMap<Venue, Arc<VenueConnector>>>,
    gap_clients: RwLock<HashMap<Venue, Arc<RestGapClient>>>,
    state: RwLock<IngestionState>,
    trade_tx: RwLock<Option<mpsc::Sender<Trade>>>,
    config_revision: AtomicU64,
    /// Set once every worker has processed WORKER_INIT; standby defers it
    /// until the first addSymbols.
    workers_initialized: std::sync::atomic::AtomicBool,
    /// Per-symbol watermark of already-recovered gap end ids.
    recovered_until: RwLock<HashMap<String, u64>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub stats: Arc<OrchestratorStats>,
}

impl IngestionOrchestrator {
    pub fn new(
        config: AppConfig,
        repo: Arc<dyn SymbolConfigRepository>,
        pool: Arc<WorkerPool>,
        store: Arc<FootprintFileStore>,
        supervisor: Option<Arc<SidecarSupervisor>>,
    ) -> Arc<Self> {
        let gap_reader = SidecarClient::new(&config.sidecar_socket_path);
        Arc::new(Self {
            config,
            repo,
            pool,
            store,
            supervisor,
            gap_reader,
            connectors: RwLock::new(HashMap::new()),
            gap_clients: RwLock::new(HashMap::new()),
            state: RwLock::new(IngestionState::Stopped),
            trade_tx: RwLock::new(None),
            config_revision: AtomicU64::new(1),
            workers_initialized: std::sync::atomic::AtomicBool::new(false),
            recovered_until: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            stats: Arc::new(OrchestratorStats::default()),
        })
    }

    pub fn store(&self) -> &Arc<FootprintFileStore> {
        &self.store
    }

    // -------------------------------------------------------------------------
    // LIFECYCLE
    // -------------------------------------------------------------------------

    /// Boot phases 0-4; see the module docs for the ordering contract.
    pub async fn start_ingestion(self: &Arc<Self>) -> Result<(), IngestError> {
        {
            let mut state = self.state.write();
            match *state {
                IngestionState::Stopped => *state = IngestionState::Starting,
                other => {
                    debug!(state = %other, "start_ingestion ignored");
                    return Ok(());
                }
            }
        }

        // Phase 0: worker pool + readiness barrier.
        if let Some(supervisor) = &self.supervisor {
            supervisor
                .start()
                .map_err(|e| IngestError::StartupFailure(format!("sidecar spawn: {e:#}")))?;
        }
        self.pool.initialize().await?;

        // Phase 1: active symbols.
        let mut symbols: Vec<SymbolConfig> = Vec::new();
        for venue in [Venue::Binance, Venue::Bybit, Venue::Okx] {
            match self.repo.active_symbols(venue).await {
                Ok(mut venue_symbols) => symbols.append(&mut venue_symbols),
                Err(e) => {
                    *self.state.write() = IngestionState::Stopped;
                    return Err(IngestError::StartupFailure(format!(
                        "active symbol fetch for {venue}: {e:#}"
                    )));
                }
            }
        }

        // Phase 3 happens before phase 4 either way: register the callback.
        self.register_trade_callback();
        self.spawn_gap_recovery_task();

        if symbols.is_empty() {
            *self.state.write() = IngestionState::Standby;
            info!("no active symbols; ingestion in standby");
            return Ok(());
        }

        // Phase 2: routing before the stream can deliver anything.
        self.init_symbol_routing(&symbols).await?;

        // Phase 4: connect and subscribe.
        self.connect_venues(&symbols).await?;

        *self.state.write() = IngestionState::Running;
        info!(symbols = symbols.len(), "ingestion_started");
        Ok(())
    }

    pub async fn stop_ingestion(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if matches!(*state, IngestionState::Stopped | IngestionState::Stopping) {
                return;
            }
            *state = IngestionState::Stopping;
        }

        let connectors: Vec<Arc<VenueConnector>> = self.connectors.write().drain().map(|(_, c)| c).collect();
        for connector in connectors {
            connector.stop().await;
        }

        // Workers flush to completion inside shutdown.
        self.pool.shutdown().await;

        if let Some(supervisor) = &self.supervisor {
            supervisor.stop().await;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.trade_tx.write() = None;
        self.workers_initialized.store(false, Ordering::SeqCst);
        *self.state.write() = IngestionState::Stopped;
        info!(stats = %self.stats.summary(), "ingestion_stopped");
    }

    // -------------------------------------------------------------------------
    // SYMBOL MANAGEMENT
    // -------------------------------------------------------------------------

    /// Idempotent: symbols already routed are a no-op.
    pub async fn add_symbols(self: &Arc<Self>, configs: Vec<SymbolConfig>) -> Result<(), IngestError> {
        let fresh: Vec<SymbolConfig> = configs
            .into_iter()
            .filter(|c| self.pool.route_is_new(&c.symbol))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        if !self.workers_initialized.load(Ordering::SeqCst) {
            // First symbols after a standby start: routing plus WORKER_INIT
            // for every worker, exactly as the normal boot path.
            self.init_symbol_routing(&fresh).await?;
        } else {
            let revision = self.config_revision.fetch_add(1, Ordering::Relaxed);
            let mut by_worker: HashMap<usize, Vec<SymbolConfig>> = HashMap::new();
            for config in &fresh {
                let worker_id = self.pool.assign_symbol_to_worker(config.clone())?;
                by_worker.entry(worker_id).or_default().push(config.clone());
            }
            for (worker_id, configs) in by_worker {
                self.pool
                    .send_symbol_assignment(worker_id, configs, revision)
                    .await?;
            }
        }

        self.connect_venues(&fresh).await?;

        let mut state = self.state.write();
        if *state == IngestionState::Standby {
            *state = IngestionState::Running;
        }
        info!(count = fresh.len(), "symbols_added");
        Ok(())
    }

    /// Unsubscribe and instruct owning workers to drop state after their
    /// next flush.
    pub async fn remove_symbols(self: &Arc<Self>, keys: Vec<(Venue, String)>) -> Result<(), IngestError> {
        let mut by_venue: HashMap<Venue, Vec<String>> = HashMap::new();
        let mut by_worker: HashMap<usize, Vec<String>> = HashMap::new();

        for (venue, symbol) in keys {
            if let Some(worker_id) = self.pool.unassign_symbol(&symbol) {
                by_worker.entry(worker_id).or_default().push(symbol.clone());
            }
            by_venue.entry(venue).or_default().push(symbol);
        }

        for (venue, symbols) in by_venue {
            let connector = self.connectors.read().get(&venue).cloned();
            if let Some(connector) = connector {
                connector.unsubscribe_symbols(&symbols).await;
            }
        }
        for (worker_id, symbols) in by_worker {
            self.pool.drop_symbols(worker_id, symbols).await?;
        }
        Ok(())
    }

    async fn init_symbol_routing(self: &Arc<Self>, symbols: &[SymbolConfig]) -> Result<(), IngestError> {
        for config in symbols {
            self.pool.assign_symbol_to_worker(config.clone())?;
        }
        // Every worker gets WORKER_INIT, including those with zero symbols,
        // so their flush timers arm.
        for worker_id in 0..self.pool.worker_count() {
            self.pool.send_worker_init(worker_id).await?;
        }
        self.workers_initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect_venues(self: &Arc<Self>, symbols: &[SymbolConfig]) -> Result<(), IngestError> {
        let mut by_venue: HashMap<Venue, Vec<String>> = HashMap::new();
        for config in symbols {
            by_venue
                .entry(config.venue)
                .or_default()
                .push(config.symbol.clone());
        }

        for (venue, venue_symbols) in by_venue {
            let connector = {
                let existing = self.connectors.read().get(&venue).cloned();
                match existing {
                    Some(connector) => connector,
                    None => {
                        let sink = self
                            .trade_tx
                            .read()
                            .clone()
                            .ok_or_else(|| IngestError::StartupFailure("trade callback not registered".into()))?;
                        let ws_url = self.repo.ws_url(venue).await.map_err(|e| {
                            IngestError::StartupFailure(format!("ws url for {venue}: {e:#}"))
                        })?;
                        let session = self.repo.session_config(venue).await.map_err(|e| {
                            IngestError::StartupFailure(format!("session config for {venue}: {e:#}"))
                        })?;
                        let connector = VenueConnector::new(venue, ws_url, session, sink);
                        let task = connector.start();
                        self.tasks.lock().push(task);
                        self.connectors.write().insert(venue, Arc::clone(&connector));
                        if venue == Venue::Binance {
                            match RestGapClient::new(venue, RestGapConfig::default()) {
                                Ok(client) => {
                                    self.gap_clients.write().insert(venue, Arc::new(client));
                                }
                                Err(e) => {
                                    error!(venue = %venue, error = %e, "gap recovery client unavailable");
                                }
                            }
                        }
                        connector
                    }
                }
            };
            connector.subscribe_symbols(&venue_symbols).await;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // TRADE FAN-OUT
    // -------------------------------------------------------------------------

    fn register_trade_callback(self: &Arc<Self>) {
        let (trade_tx, trade_rx) = mpsc::channel(self.config.trade_channel_capacity);
        *self.trade_tx.write() = Some(trade_tx);
        let orchestrator = Arc::clone(self);
        let task = tokio::spawn(async move {
            orchestrator.fan_out_loop(trade_rx).await;
        });
        self.tasks.lock().push(task);
    }

    /// One in-flight batch per symbol; trades arriving meanwhile buffer and
    /// drain in id order.
    async fn fan_out_loop(self: Arc<Self>, mut trade_rx: mpsc::Receiver<Trade>) {
        #[derive(Default)]
        struct SymbolDispatch {
            in_flight: bool,
            buffer: Vec<Trade>,
        }

        let mut dispatch: HashMap<String, SymbolDispatch> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::channel::<String>(1_024);

        loop {
            tokio::select! {
                trade = trade_rx.recv() => {
                    let Some(trade) = trade else { break };
                    self.stats.trades_received.fetch_add(1, Ordering::Relaxed);
                    let symbol = trade.symbol.clone();
                    let entry = dispatch.entry(symbol.clone()).or_default();
                    entry.buffer.push(trade);
                    if !entry.in_flight {
                        entry.in_flight = true;
                        let mut batch = std::mem::take(&mut entry.buffer);
                        batch.sort_by_key(|t| t.trade_id);
                        self.spawn_batch(symbol, batch, done_tx.clone());
                    }
                }
                completed = done_rx.recv() => {
                    let Some(symbol) = completed else { break };
                    if let Some(entry) = dispatch.get_mut(&symbol) {
                        if entry.buffer.is_empty() {
                            entry.in_flight = false;
                        } else {
                            let mut batch = std::mem::take(&mut entry.buffer);
                            batch.sort_by_key(|t| t.trade_id);
                            self.spawn_batch(symbol, batch, done_tx.clone());
                        }
                    }
                }
            }
        }
    }

    fn spawn_batch(self: &Arc<Self>, symbol: String, batch: Vec<Trade>, done_tx: mpsc::Sender<String>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.stats.batches_dispatched.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = orchestrator
                .pool
                .route_trades(&symbol, batch, Priority::Normal)
                .await
            {
                orchestrator.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %symbol, error = %e, "trade batch dispatch failed");
            }
            let _ = done_tx.send(symbol).await;
        });
    }

    /// Resubmit recovered (or late) trades with urgent priority so they jump
    /// ahead of the normal lane in the owning worker's inbox.
    pub async fn inject_recovered_trades(
        &self,
        symbol: &str,
        trades: Vec<Trade>,
    ) -> Result<(), IngestError> {
        if trades.is_empty() {
            return Ok(());
        }
        let count = trades.len();
        self.pool
            .route_trades(symbol, trades, Priority::Urgent)
            .await?;
        self.stats
            .recovered_trades_routed
            .fetch_add(count as u64, Ordering::Relaxed);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // GAP RECOVERY USE CASE
    // -------------------------------------------------------------------------

    fn spawn_gap_recovery_task(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(GAP_RECOVERY_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                orchestrator.recover_pending_gaps().await;
            }
        });
        self.tasks.lock().push(task);
    }

    /// Read gaps the workers reported to the sidecar, fetch the missing
    /// trades over REST, and resubmit them with urgent priority.
    async fn recover_pending_gaps(self: &Arc<Self>) {
        let gap_client = self.gap_clients.read().get(&Venue::Binance).cloned();
        let Some(gap_client) = gap_client else { return };

        let symbols: Vec<String> = self.pool.routed_symbols();
        for symbol in symbols {
            let since = self.recovered_until.read().get(&symbol).copied().unwrap_or(0);
            let gaps = match self.gap_reader.list_gaps(&symbol, since).await {
                Ok(gaps) => gaps,
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "gap listing unavailable");
                    continue;
                }
            };

            for gap in gaps {
                match gap_client
                    .sync_missing_trades(&symbol, gap.start_id, gap.end_id)
                    .await
                {
                    Ok(trades) if !trades.is_empty() => {
                        let count = trades.len();
                        match self.inject_recovered_trades(&symbol, trades).await {
                            Ok(()) => {
                                self.stats.gaps_recovered.fetch_add(1, Ordering::Relaxed);
                                self.recovered_until
                                    .write()
                                    .insert(symbol.clone(), gap.end_id);
                                info!(symbol = %symbol, start = gap.start_id, end = gap.end_id, count, "gap_recovered");
                            }
                            Err(e) => {
                                warn!(symbol = %symbol, error = %e, "recovered trade routing failed");
                            }
                        }
                    }
                    Ok(_) => {
                        // Nothing to fetch (venue pruned the ids); move on.
                        self.recovered_until
                            .write()
                            .insert(symbol.clone(), gap.end_id);
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "gap recovery fetch failed");
                        break; // Rate limited or transient; retry next cycle.
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // STATUS & HEALTH
    // -------------------------------------------------------------------------

    pub fn get_status(&self) -> IngestionState {
        *self.state.read()
    }

    pub fn is_healthy(&self) -> bool {
        let state_ok = matches!(
            self.get_status(),
            IngestionState::Running | IngestionState::Standby
        );
        let sidecar_ok = self
            .supervisor
            .as_ref()
            .map(|s| !s.is_critical())
            .unwrap_or(true);
        state_ok && !self.pool.has_permanent_failures() && sidecar_ok
    }

    pub fn get_health_metrics(&self) -> HealthMetrics {
        let connectors = self
            .connectors
            .read()
            .values()
            .map(|c| {
                let m = &c.tracker().metrics;
                ConnectorHealth {
                    venue: c.venue().as_str().to_string(),
                    state: c.tracker().state().to_string(),
                    streams: c.stream_count(),
                    frames_received: m.frames_received.load(Ordering::Relaxed),
                    trades_decoded: m.trades_decoded.load(Ordering::Relaxed),
                    reconnections: m.reconnections.load(Ordering::Relaxed),
                }
            })
            .collect();

        let sidecar_status = match self.supervisor.as_ref().map(|s| s.status()) {
            Some(SupervisorStatus::Running) => "RUNNING",
            Some(SupervisorStatus::Stopped) => "STOPPED",
            Some(SupervisorStatus::Critical) => "CRITICAL",
            None => "EXTERNAL",
        };

        HealthMetrics {
            state: self.get_status().to_string(),
            healthy: self.is_healthy(),
            worker_count: self.pool.worker_count(),
            pool_initialized: self.pool.is_initialized(),
            pool_permanent_failures: self.pool.has_permanent_failures(),
            active_symbols: self.pool.routed_symbols().len(),
            trades_received: self.stats.trades_received.load(Ordering::Relaxed),
            connectors,
            sidecar_status: sidecar_status.to_string(),
        }
    }
}
