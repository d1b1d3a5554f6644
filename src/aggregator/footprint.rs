//! Per-symbol footprint aggregation state machine.
//!
//! Each worker owns one aggregator for its assigned symbols. Trades arrive
//! in ascending id order per symbol; the aggregator deduplicates against the
//! persisted floor, records id gaps for later recovery, folds trades into
//! the open candle of every configured interval, and emits candles as they
//! complete.
//!
//! Gap recovery is exact while the affected candles are still open: when a
//! gap is detected the aggregator snapshots the open candles and buffers
//! every subsequent trade. A recovered trade landing inside the gap restores
//! the snapshot and replays the buffer in id order, so the resulting candle
//! is identical to one built from an unbroken stream. Once an affected
//! candle completes (or the buffer cap is hit) the window is dropped and
//! late recoveries fall back to the deduplication floor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::models::{FootprintCandle, Interval, SymbolConfig, Trade, TradeGap};
use crate::sidecar::protocol::DirtyEntry;

/// Trades buffered per recovery window before giving up on exact replay.
const MAX_REPLAY_BUFFER: usize = 10_000;

// =============================================================================
// STATS
// =============================================================================

#[derive(Debug, Default)]
pub struct AggregatorStats {
    pub trades_processed: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub gaps_detected: AtomicU64,
    pub trades_recovered: AtomicU64,
    pub candles_completed: AtomicU64,
    pub unassigned_dropped: AtomicU64,
}

impl AggregatorStats {
    pub fn summary(&self) -> String {
        format!(
            "trades={} duplicates={} gaps={} recovered={} completed={} unassigned={}",
            self.trades_processed.load(Ordering::Relaxed),
            self.duplicates_dropped.load(Ordering::Relaxed),
            self.gaps_detected.load(Ordering::Relaxed),
            self.trades_recovered.load(Ordering::Relaxed),
            self.candles_completed.load(Ordering::Relaxed),
            self.unassigned_dropped.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> AggregatorStatsSnapshot {
        AggregatorStatsSnapshot {
            trades_processed: self.trades_processed.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            trades_recovered: self.trades_recovered.load(Ordering::Relaxed),
            candles_completed: self.candles_completed.load(Ordering::Relaxed),
            unassigned_dropped: self.unassigned_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AggregatorStatsSnapshot {
    pub trades_processed: u64,
    pub duplicates_dropped: u64,
    pub gaps_detected: u64,
    pub trades_recovered: u64,
    pub candles_completed: u64,
    pub unassigned_dropped: u64,
}

// =============================================================================
// APPLY OUTCOME
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOutcome {
    Applied,
    /// Applied, and a gap was recorded behind it.
    AppliedWithGap(TradeGap),
    /// A recovered trade filled part of a pending gap.
    Recovered,
    /// Dropped: id at or below the deduplication floor.
    Duplicate,
    /// Dropped: symbol not assigned to this aggregator.
    Unassigned,
}

/// Result of folding one trade: candles completed by the boundary crossing,
/// plus what happened to the trade itself.
#[derive(Debug)]
pub struct ApplyResult {
    pub outcome: TradeOutcome,
    pub completed: Vec<FootprintCandle>,
}

impl ApplyResult {
    fn dropped(outcome: TradeOutcome) -> Self {
        Self {
            outcome,
            completed: Vec::new(),
        }
    }
}

// =============================================================================
// RECOVERY WINDOW
// =============================================================================

/// Snapshot-and-replay state for exact out-of-order gap recovery.
#[derive(Debug)]
struct RecoveryWindow {
    /// Open candles as of just before the first post-gap trade.
    snapshot: HashMap<Interval, FootprintCandle>,
    snapshot_last_id: u64,
    /// Unfilled id ranges, ascending by start.
    gaps: Vec<TradeGap>,
    /// Every trade applied since the snapshot, including recovered ones.
    buffered: Vec<Trade>,
}

impl RecoveryWindow {
    /// Remove `id` from the pending gaps, splitting the containing range.
    /// Returns false when no gap contains it.
    fn consume(&mut self, id: u64) -> bool {
        let Some(pos) = self
            .gaps
            .iter()
            .position(|g| id > g.start_id && id < g.end_id)
        else {
            return false;
        };
        let gap = self.gaps.remove(pos);
        if id - gap.start_id > 1 {
            self.gaps.push(TradeGap {
                start_id: gap.start_id,
                end_id: id,
            });
        }
        if gap.end_id - id > 1 {
            self.gaps.push(TradeGap {
                start_id: id,
                end_id: gap.end_id,
            });
        }
        self.gaps.sort_by_key(|g| g.start_id);
        true
    }
}

// =============================================================================
// PER-SYMBOL STATE
// =============================================================================

#[derive(Debug)]
struct SymbolState {
    config: SymbolConfig,
    config_revision: u64,
    open: HashMap<Interval, FootprintCandle>,
    last_trade_id: u64,
    dirty: bool,
    /// Gaps awaiting REST recovery, reported to the sidecar on flush.
    pending_gaps: Vec<TradeGap>,
    recovery: Option<RecoveryWindow>,
}

impl SymbolState {
    fn new(config: SymbolConfig) -> Self {
        Self {
            config,
            config_revision: 0,
            open: HashMap::new(),
            last_trade_id: 0,
            dirty: false,
            pending_gaps: Vec::new(),
            recovery: None,
        }
    }
}

// =============================================================================
// AGGREGATOR
// =============================================================================

pub struct FootprintAggregator {
    intervals: Vec<Interval>,
    states: HashMap<String, SymbolState>,
    pub stats: AggregatorStats,
}

impl FootprintAggregator {
    pub fn new(intervals: Vec<Interval>) -> Self {
        Self {
            intervals,
            states: HashMap::new(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn symbols(&self) -> Vec<String> {
        self.states.keys().cloned().collect()
    }

    pub fn is_assigned(&self, symbol: &str) -> bool {
        self.states.contains_key(symbol)
    }

    /// Register a symbol. A no-op when already assigned.
    pub fn assign_symbol(&mut self, config: SymbolConfig) {
        self.states
            .entry(config.symbol.clone())
            .or_insert_with(|| SymbolState::new(config));
    }

    /// Drop a symbol's state entirely (after its last flush).
    pub fn remove_symbol(&mut self, symbol: &str) {
        self.states.remove(symbol);
    }

    /// Adopt a persisted deduplication floor, keeping the higher of the two.
    pub fn set_floor(&mut self, symbol: &str, last_trade_id: u64) {
        if let Some(state) = self.states.get_mut(symbol) {
            if last_trade_id > state.last_trade_id {
                state.last_trade_id = last_trade_id;
            }
        }
    }

    pub fn floor(&self, symbol: &str) -> Option<u64> {
        self.states.get(symbol).map(|s| s.last_trade_id)
    }

    /// Apply a configuration change. Bins are not reassignable, so a new
    /// bin multiplier completes the open candles (even short ones) and the
    /// next trade starts fresh under the new geometry.
    pub fn update_config(&mut self, config: SymbolConfig, revision: u64) -> Vec<FootprintCandle> {
        use std::collections::hash_map::Entry;
        let state = match self.states.entry(config.symbol.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(SymbolState::new(config));
                return Vec::new();
            }
            Entry::Occupied(occupied) => occupied.into_mut(),
        };
        if revision <= state.config_revision {
            return Vec::new();
        }

        let mut completed = Vec::new();
        if state.config.bin_multiplier != config.bin_multiplier {
            debug!(
                symbol = %config.symbol,
                old = state.config.bin_multiplier,
                new = config.bin_multiplier,
                "bin multiplier changed; completing open candles"
            );
            for (_, mut candle) in state.open.drain() {
                candle.finalize();
                completed.push(candle);
            }
            state.recovery = None;
            state.dirty = true;
        }
        state.config = config;
        state.config_revision = revision;
        self.stats
            .candles_completed
            .fetch_add(completed.len() as u64, Ordering::Relaxed);
        completed
    }

    /// Fold one trade into the symbol's open candles.
    pub fn apply(&mut self, trade: &Trade) -> ApplyResult {
        let Self {
            intervals,
            states,
            stats,
        } = self;
        let Some(state) = states.get_mut(&trade.symbol) else {
            stats.unassigned_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %trade.symbol, "trade for unassigned symbol dropped");
            return ApplyResult::dropped(TradeOutcome::Unassigned);
        };

        if state.last_trade_id > 0 && trade.trade_id <= state.last_trade_id {
            // At or below the floor: either a recovered trade filling a
            // pending gap, or a plain duplicate.
            if state
                .recovery
                .as_mut()
                .map(|w| w.consume(trade.trade_id))
                .unwrap_or(false)
            {
                return Self::replay_with_recovered(state, intervals, stats, trade);
            }
            stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            return ApplyResult::dropped(TradeOutcome::Duplicate);
        }

        // Gap detection never blocks processing.
        let mut gap = None;
        if state.last_trade_id > 0 && trade.trade_id > state.last_trade_id + 1 {
            let g = TradeGap {
                start_id: state.last_trade_id,
                end_id: trade.trade_id,
            };
            state.pending_gaps.push(g);
            stats.gaps_detected.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %trade.symbol, start = g.start_id, end = g.end_id, "gap_detected");

            match state.recovery {
                Some(ref mut window) => window.gaps.push(g),
                None => {
                    state.recovery = Some(RecoveryWindow {
                        snapshot: state.open.clone(),
                        snapshot_last_id: state.last_trade_id,
                        gaps: vec![g],
                        buffered: Vec::new(),
                    });
                }
            }
            gap = Some(g);
        }

        let completed = Self::fold(state, intervals, trade);

        let drop_window = match state.recovery.as_mut() {
            Some(window) => {
                window.buffered.push(trade.clone());
                // An affected candle completed, or the buffer outgrew its
                // cap: exact replay is no longer possible.
                !completed.is_empty() || window.buffered.len() > MAX_REPLAY_BUFFER
            }
            None => false,
        };
        if drop_window {
            state.recovery = None;
        }

        state.dirty = true;
        stats.trades_processed.fetch_add(1, Ordering::Relaxed);
        stats
            .candles_completed
            .fetch_add(completed.len() as u64, Ordering::Relaxed);

        ApplyResult {
            outcome: match gap {
                Some(g) => TradeOutcome::AppliedWithGap(g),
                None => TradeOutcome::Applied,
            },
            completed,
        }
    }

    /// Apply one trade to the open candles, emitting completions on interval
    /// boundary crossings. Shared by the live path and the replay path.
    fn fold(state: &mut SymbolState, intervals: &[Interval], trade: &Trade) -> Vec<FootprintCandle> {
        let mut completed = Vec::new();
        for &interval in intervals {
            let interval_start = interval.align(trade.trade_time);

            let boundary_crossed = state
                .open
                .get(&interval)
                .map(|open| open.open_time != interval_start)
                .unwrap_or(false);
            if boundary_crossed {
                if let Some(mut done) = state.open.remove(&interval) {
                    done.finalize();
                    completed.push(done);
                }
            }

            let candle = state.open.entry(interval).or_insert_with(|| {
                FootprintCandle::new(trade.venue, trade.symbol.clone(), interval, interval_start)
            });
            candle.apply_trade(trade, state.config.tick_value, state.config.bin_multiplier);
        }
        if trade.trade_id > state.last_trade_id {
            state.last_trade_id = trade.trade_id;
        }
        completed
    }

    /// A recovered trade landed inside the window: restore the snapshot and
    /// replay everything in id order so the candle matches an unbroken feed.
    fn replay_with_recovered(
        state: &mut SymbolState,
        intervals: &[Interval],
        stats: &AggregatorStats,
        trade: &Trade,
    ) -> ApplyResult {
        let Some(window) = state.recovery.as_mut() else {
            return ApplyResult::dropped(TradeOutcome::Duplicate);
        };
        window.buffered.push(trade.clone());
        window.buffered.sort_by_key(|t| t.trade_id);
        let replay: Vec<Trade> = window.buffered.clone();
        let snapshot = window.snapshot.clone();
        let snapshot_last_id = window.snapshot_last_id;
        let fully_recovered = window.gaps.is_empty();

        state.open = snapshot;
        state.last_trade_id = snapshot_last_id;

        let mut completed = Vec::new();
        for t in &replay {
            completed.extend(Self::fold(state, intervals, t));
        }

        if fully_recovered || !completed.is_empty() {
            state.recovery = None;
        }

        state.dirty = true;
        stats.trades_recovered.fetch_add(1, Ordering::Relaxed);
        stats.trades_processed.fetch_add(1, Ordering::Relaxed);
        stats
            .candles_completed
            .fetch_add(completed.len() as u64, Ordering::Relaxed);

        ApplyResult {
            outcome: TradeOutcome::Recovered,
            completed,
        }
    }

    /// Snapshot and clear every dirty symbol for the periodic sidecar flush.
    pub fn drain_dirty(&mut self) -> Vec<DirtyEntry> {
        let mut entries = Vec::new();
        for state in self.states.values_mut() {
            if !state.dirty {
                continue;
            }
            entries.push(DirtyEntry {
                symbol: state.config.symbol.clone(),
                last_trade_id: state.last_trade_id,
                candles: state.open.values().cloned().collect(),
                gaps: std::mem::take(&mut state.pending_gaps),
            });
            state.dirty = false;
        }
        entries
    }

    /// Dirty symbols pending the next flush.
    pub fn dirty_count(&self) -> usize {
        self.states.values().filter(|s| s.dirty).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Venue;

    fn config() -> SymbolConfig {
        SymbolConfig::new(Venue::Binance, "BTCUSDT", 0.1)
    }

    fn trade(id: u64, ts: i64, price: f64, qty: f64, maker: bool) -> Trade {
        Trade {
            venue: Venue::Binance,
            symbol: "BTCUSDT".to_string(),
            trade_id: id,
            event_time: ts,
            trade_time: ts,
            price,
            price_raw: price.to_string(),
            quantity: qty,
            is_buyer_maker: maker,
        }
    }

    fn aggregator() -> FootprintAggregator {
        let mut agg = FootprintAggregator::new(vec![Interval::M1]);
        agg.assign_symbol(config());
        agg
    }

    const T0: i64 = 1_700_000_000_000 - 1_700_000_000_000 % 60_000;

    #[test]
    fn builds_single_candle() {
        let mut agg = aggregator();
        agg.apply(&trade(1, T0 + 500, 100.0, 1.0, false));
        agg.apply(&trade(2, T0 + 30_000, 100.2, 2.0, true));
        agg.apply(&trade(3, T0 + 59_999, 100.1, 1.0, false));

        // Candle still open; next interval's trade completes it.
        let result = agg.apply(&trade(4, T0 + 60_001, 100.3, 1.0, false));
        assert_eq!(result.completed.len(), 1);
        let c = &result.completed[0];
        assert_eq!(c.open_time, T0);
        assert_eq!(c.close_time, T0 + 59_999);
        assert!(c.complete);
        assert_eq!(c.open, 100.0);
        assert_eq!(c.close, 100.1);
        assert_eq!(c.delta_max, 1.0);
        assert_eq!(c.delta_min, -1.0);
        assert_eq!(c.trade_count, 3);
    }

    #[test]
    fn duplicate_dropped_once() {
        let mut agg = aggregator();
        agg.apply(&trade(5, T0, 100.0, 1.0, false));
        let result = agg.apply(&trade(5, T0 + 10, 100.0, 1.0, false));
        assert_eq!(result.outcome, TradeOutcome::Duplicate);
        assert_eq!(agg.stats.duplicates_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(agg.stats.trades_processed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn floor_from_sidecar_dedupes() {
        let mut agg = aggregator();
        agg.set_floor("BTCUSDT", 10);
        assert_eq!(agg.apply(&trade(9, T0, 100.0, 1.0, false)).outcome, TradeOutcome::Duplicate);
        assert_eq!(agg.apply(&trade(10, T0, 100.0, 1.0, false)).outcome, TradeOutcome::Duplicate);
        assert_eq!(agg.apply(&trade(11, T0, 100.0, 1.0, false)).outcome, TradeOutcome::Applied);
    }

    #[test]
    fn gap_recorded_without_blocking() {
        let mut agg = aggregator();
        agg.set_floor("BTCUSDT", 10);
        let result = agg.apply(&trade(13, T0, 100.0, 1.0, false));
        match result.outcome {
            TradeOutcome::AppliedWithGap(g) => {
                assert_eq!(g, TradeGap { start_id: 10, end_id: 13 });
                assert_eq!(g.missing(), 2);
            }
            other => panic!("expected gap, got {:?}", other),
        }

        let dirty = agg.drain_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].gaps, vec![TradeGap { start_id: 10, end_id: 13 }]);
    }

    #[test]
    fn out_of_order_recovery_matches_direct_feed() {
        // Feed 13 first, then recovered 11 and 12: the candle must equal the
        // one built from 11, 12, 13 in order, including delta extrema.
        let trades = [
            (11u64, T0 + 100, 100.5, 1.0, true),
            (12, T0 + 200, 100.7, 2.0, false),
            (13, T0 + 300, 100.6, 1.5, true),
        ];
        let make = |ids: &[u64]| {
            let mut agg = aggregator();
            agg.set_floor("BTCUSDT", 10);
            for &id in ids {
                let (tid, ts, p, q, m) = trades[(id - 11) as usize];
                assert_eq!(tid, id);
                agg.apply(&trade(id, ts, p, q, m));
            }
            let done = agg.apply(&trade(50, T0 + 60_000, 101.0, 1.0, false)).completed;
            assert_eq!(done.len(), 1);
            done.into_iter().next().unwrap()
        };

        let direct = make(&[11, 12, 13]);
        let recovered = make(&[13, 11, 12]);
        assert_eq!(direct, recovered);
        assert_eq!(recovered.open, 100.5);
        assert_eq!(recovered.close, 100.6);
        assert_eq!(recovered.first_trade_id, 11);
        assert_eq!(recovered.last_trade_id, 13);
    }

    #[test]
    fn recovered_outcome_and_stats() {
        let mut agg = aggregator();
        agg.set_floor("BTCUSDT", 10);
        agg.apply(&trade(13, T0 + 300, 100.0, 1.0, false));
        assert_eq!(agg.apply(&trade(11, T0 + 100, 100.0, 1.0, false)).outcome, TradeOutcome::Recovered);
        assert_eq!(agg.apply(&trade(12, T0 + 200, 100.0, 1.0, false)).outcome, TradeOutcome::Recovered);
        // Window fully recovered; a replayed id is a plain duplicate now.
        assert_eq!(agg.apply(&trade(12, T0 + 200, 100.0, 1.0, false)).outcome, TradeOutcome::Duplicate);
        assert_eq!(agg.stats.trades_recovered.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn recovery_window_dropped_after_candle_completes() {
        let mut agg = aggregator();
        agg.set_floor("BTCUSDT", 10);
        agg.apply(&trade(13, T0 + 300, 100.0, 1.0, false));
        // Boundary crossing completes the gapped candle and ends the window.
        agg.apply(&trade(14, T0 + 60_100, 100.0, 1.0, false));
        assert_eq!(agg.apply(&trade(11, T0 + 100, 100.0, 1.0, false)).outcome, TradeOutcome::Duplicate);
    }

    #[test]
    fn multiplier_change_completes_open_candle() {
        let mut agg = aggregator();
        agg.apply(&trade(1, T0 + 100, 100.0, 1.0, false));

        let completed = agg.update_config(config().with_bin_multiplier(5), 1);
        assert_eq!(completed.len(), 1);
        assert!(completed[0].complete);
        assert_eq!(completed[0].trade_count, 1);

        // Next trade starts a fresh candle with the new geometry.
        let result = agg.apply(&trade(2, T0 + 200, 100.2, 1.0, false));
        assert!(result.completed.is_empty());
        let dirty = agg.drain_dirty();
        let candle = dirty[0].candles.iter().find(|c| c.interval == Interval::M1).unwrap();
        // 100.2 / 0.1 = 1002 ticks, multiplier 5 -> bin 200.
        assert!(candle.bins.contains_key(&200));
    }

    #[test]
    fn stale_config_revision_ignored() {
        let mut agg = aggregator();
        agg.update_config(config().with_bin_multiplier(5), 3);
        let completed = agg.update_config(config().with_bin_multiplier(10), 2);
        assert!(completed.is_empty());
    }

    #[test]
    fn multiple_intervals_complete_independently() {
        let mut agg = FootprintAggregator::new(vec![Interval::M1, Interval::M5]);
        agg.assign_symbol(config());

        let base = 1_700_000_100_000 - 1_700_000_100_000 % 300_000;
        agg.apply(&trade(1, base + 100, 100.0, 1.0, false));
        // Crosses the 1m boundary but stays inside the 5m slot.
        let result = agg.apply(&trade(2, base + 61_000, 100.1, 1.0, false));
        assert_eq!(result.completed.len(), 1);
        assert_eq!(result.completed[0].interval, Interval::M1);

        // Crossing the 5m boundary completes both.
        let result = agg.apply(&trade(3, base + 301_000, 100.2, 1.0, false));
        let intervals: Vec<Interval> = result.completed.iter().map(|c| c.interval).collect();
        assert!(intervals.contains(&Interval::M1));
        assert!(intervals.contains(&Interval::M5));
    }

    #[test]
    fn drain_dirty_clears_flag() {
        let mut agg = aggregator();
        agg.apply(&trade(1, T0, 100.0, 1.0, false));
        assert_eq!(agg.dirty_count(), 1);

        let entries = agg.drain_dirty();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].last_trade_id, 1);
        assert_eq!(entries[0].candles.len(), 1);
        assert_eq!(agg.dirty_count(), 0);
        assert!(agg.drain_dirty().is_empty());
    }

    #[test]
    fn unassigned_symbol_skipped() {
        let mut agg = FootprintAggregator::new(vec![Interval::M1]);
        let result = agg.apply(&trade(1, T0, 100.0, 1.0, false));
        assert_eq!(result.outcome, TradeOutcome::Unassigned);
        assert_eq!(agg.stats.unassigned_dropped.load(Ordering::Relaxed), 1);
    }
}
