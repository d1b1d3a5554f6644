//! The worker task: single-threaded owner of its symbols' aggregation state.
//!
//! Messages are processed strictly sequentially; the urgent lane is drained
//! before the normal lane. The periodic flush timer starts once WORKER_INIT
//! provides the sidecar socket, and flush failures buffer dirty state in
//! memory for the next attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::aggregator::FootprintAggregator;
use crate::models::Interval;
use crate::pool::messages::{Envelope, TradeBatchResult, WorkerRequest, WorkerStatusReport};
use crate::sidecar::protocol::DirtyEntry;
use crate::sidecar::SidecarClient;
use crate::storage::FootprintFileStore;

/// Shared dependencies handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub store: Arc<FootprintFileStore>,
    pub intervals: Vec<Interval>,
}

/// Worker event loop. `ready_tx` fires after initialization, before the
/// first message is consumed; the pool's readiness barrier waits on it.
pub async fn run_worker(
    ctx: WorkerContext,
    mut urgent_rx: mpsc::Receiver<Envelope>,
    mut normal_rx: mpsc::Receiver<Envelope>,
    ready_tx: oneshot::Sender<usize>,
) {
    let worker_id = ctx.worker_id;
    let mut aggregator = FootprintAggregator::new(ctx.intervals.clone());
    let mut sidecar: Option<SidecarClient> = None;
    let mut flush_interval = Duration::from_secs(30);
    let mut flush_timer = tokio::time::interval(flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut flush_started = false;
    // Dirty entries that failed to reach the sidecar, merged by symbol.
    let mut flush_backlog: HashMap<String, DirtyEntry> = HashMap::new();

    if ready_tx.send(worker_id).is_err() {
        // Pool gave up on us during spawn.
        return;
    }
    info!(worker_id, "worker_ready");

    loop {
        let envelope = tokio::select! {
            biased;

            Some(envelope) = urgent_rx.recv() => envelope,
            Some(envelope) = normal_rx.recv() => envelope,
            _ = flush_timer.tick(), if flush_started => {
                flush_dirty(worker_id, &mut aggregator, sidecar.as_ref(), &mut flush_backlog).await;
                continue;
            }
            else => {
                debug!(worker_id, "worker inbox closed");
                return;
            }
        };

        let correlation_id = envelope.correlation_id;
        match envelope.request {
            WorkerRequest::WorkerInit { init, reply } => {
                let client = SidecarClient::new(&init.socket_path);
                let symbols: Vec<String> =
                    init.assigned_symbols.iter().map(|c| c.symbol.clone()).collect();
                for config in init.assigned_symbols {
                    aggregator.assign_symbol(config);
                }

                // Adopt persisted floors; a dead sidecar is not fatal here,
                // floors simply start at zero until the next flush reconnects.
                if !symbols.is_empty() {
                    match client.load_states_for_symbols(&symbols).await {
                        Ok(states) => {
                            for (symbol, floor) in states {
                                aggregator.set_floor(&symbol, floor);
                            }
                        }
                        Err(e) => {
                            warn!(worker_id, error = %e, "state load failed; floors start at zero");
                        }
                    }
                }

                sidecar = Some(client);
                flush_interval = init.flush_interval;
                flush_timer = tokio::time::interval(flush_interval);
                flush_timer
                    .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                flush_timer.reset();
                flush_started = true;
                let _ = reply.send(Ok(correlation_id));
            }

            WorkerRequest::ProcessTrades { symbol: _, trades, reply } => {
                let started = Instant::now();
                let mut completed = 0usize;
                let count = trades.len();
                for trade in &trades {
                    let result = aggregator.apply(trade);
                    for candle in result.completed {
                        completed += 1;
                        // One bad candle must not poison the batch.
                        if let Err(e) = ctx.store.save(&candle) {
                            error!(
                                worker_id,
                                symbol = %candle.symbol,
                                interval = %candle.interval,
                                open_time = candle.open_time,
                                error = %e,
                                "candle persist failed"
                            );
                        }
                    }
                }
                let _ = reply.send(TradeBatchResult {
                    correlation_id,
                    success: true,
                    worker_id,
                    trade_count: count,
                    candles_completed: completed,
                    processing_time: started.elapsed(),
                });
            }

            WorkerRequest::SymbolAssignment { configs, revision, reply } => {
                let fresh: Vec<String> = configs
                    .iter()
                    .filter(|c| !aggregator.is_assigned(&c.symbol))
                    .map(|c| c.symbol.clone())
                    .collect();
                for config in configs {
                    for candle in aggregator.update_config(config, revision) {
                        if let Err(e) = ctx.store.save(&candle) {
                            error!(worker_id, error = %e, "candle persist failed on config change");
                        }
                    }
                }
                // Newly assigned symbols adopt their persisted floors.
                if !fresh.is_empty() {
                    if let Some(client) = sidecar.as_ref() {
                        match client.load_states_for_symbols(&fresh).await {
                            Ok(states) => {
                                for (symbol, floor) in states {
                                    aggregator.set_floor(&symbol, floor);
                                }
                            }
                            Err(e) => {
                                warn!(worker_id, error = %e, "state load for new symbols failed");
                            }
                        }
                    }
                }
                let _ = reply.send(correlation_id);
            }

            WorkerRequest::WorkerStatus { reply } => {
                let _ = reply.send(WorkerStatusReport {
                    correlation_id,
                    worker_id,
                    assigned_symbols: aggregator.symbols(),
                    dirty_symbols: aggregator.dirty_count(),
                    sidecar_connected: sidecar.is_some(),
                    stats: aggregator.stats.snapshot(),
                });
            }

            WorkerRequest::SyncMetrics { reply } => {
                let _ = reply.send(aggregator.stats.snapshot());
            }

            WorkerRequest::Heartbeat { reply } => {
                let _ = reply.send(correlation_id);
            }

            WorkerRequest::DropSymbols { symbols, reply } => {
                // Flush first so the sidecar keeps the final floor, then drop.
                flush_dirty(worker_id, &mut aggregator, sidecar.as_ref(), &mut flush_backlog).await;
                for symbol in &symbols {
                    aggregator.remove_symbol(symbol);
                    flush_backlog.remove(symbol);
                }
                info!(worker_id, count = symbols.len(), "symbols dropped");
                let _ = reply.send(correlation_id);
            }

            WorkerRequest::Shutdown { reply } => {
                flush_dirty(worker_id, &mut aggregator, sidecar.as_ref(), &mut flush_backlog).await;
                if let Some(client) = sidecar.as_ref() {
                    if let Err(e) = client.flush_all().await {
                        warn!(worker_id, error = %e, "flush_all on shutdown failed");
                    }
                }
                info!(worker_id, "worker_shutdown");
                let _ = reply.send(correlation_id);
                return;
            }
        }
    }
}

/// Push dirty state (plus any backlog from failed attempts) to the sidecar.
async fn flush_dirty(
    worker_id: usize,
    aggregator: &mut FootprintAggregator,
    sidecar: Option<&SidecarClient>,
    backlog: &mut HashMap<String, DirtyEntry>,
) {
    for entry in aggregator.drain_dirty() {
        merge_backlog(backlog, entry);
    }
    if backlog.is_empty() {
        return;
    }
    let Some(client) = sidecar else {
        return;
    };

    let batch: Vec<DirtyEntry> = backlog.values().cloned().collect();
    let count = batch.len();
    match client.write_dirty(batch).await {
        Ok(()) => {
            backlog.clear();
            debug!(worker_id, count, "dirty state flushed");
        }
        Err(e) => {
            // Keep buffering; the next tick retries with merged state.
            warn!(worker_id, count, error = %e, "dirty flush failed; buffering");
        }
    }
}

/// Later snapshots replace earlier ones for a symbol; gap observations are
/// additive.
fn merge_backlog(backlog: &mut HashMap<String, DirtyEntry>, entry: DirtyEntry) {
    use std::collections::hash_map::Entry;
    match backlog.entry(entry.symbol.clone()) {
        Entry::Occupied(mut occupied) => {
            let existing = occupied.get_mut();
            existing.last_trade_id = existing.last_trade_id.max(entry.last_trade_id);
            existing.candles = entry.candles;
            existing.gaps.extend(entry.gaps);
        }
        Entry::Vacant(vacant) => {
            vacant.insert(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeGap;

    fn entry(symbol: &str, floor: u64, gaps: Vec<TradeGap>) -> DirtyEntry {
        DirtyEntry {
            symbol: symbol.to_string(),
            last_trade_id: floor,
            candles: vec![],
            gaps,
        }
    }

    #[test]
    fn backlog_merges_by_symbol() {
        let mut backlog = HashMap::new();
        merge_backlog(&mut backlog, entry("BTCUSDT", 10, vec![TradeGap { start_id: 1, end_id: 4 }]));
        merge_backlog(&mut backlog, entry("BTCUSDT", 20, vec![TradeGap { start_id: 12, end_id: 15 }]));
        merge_backlog(&mut backlog, entry("ETHUSDT", 5, vec![]));

        assert_eq!(backlog.len(), 2);
        let btc = &backlog["BTCUSDT"];
        assert_eq!(btc.last_trade_id, 20);
        assert_eq!(btc.gaps.len(), 2);
    }

    #[test]
    fn backlog_floor_never_regresses() {
        let mut backlog = HashMap::new();
        merge_backlog(&mut backlog, entry("BTCUSDT", 30, vec![]));
        merge_backlog(&mut backlog, entry("BTCUSDT", 20, vec![]));
        assert_eq!(backlog["BTCUSDT"].last_trade_id, 30);
    }
}
