//! Append-only footprint candle store.
//!
//! Layout:
//! `{base}/{VENUE}/{SYMBOL}/{candles|footprints}/{interval}/{period}.bin`
//! with a JSON `.idx` sibling per period file and a `metadata.json` per
//! interval directory.
//!
//! Save is idempotent: duplicates detected through the in-memory
//! recent-timestamps cache or the `.idx` range check are treated as success.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{IngestError, IngestResult};
use crate::models::{FootprintCandle, Interval, Venue};
use crate::storage::codec::{self, DecodedRecord};
use crate::storage::partition::{self, Partition};
use crate::storage::period_file::{self, PeriodFileHeader, HEADER_SIZE};

// =============================================================================
// DATA KIND
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Candles,
    Footprints,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Candles => "candles",
            Self::Footprints => "footprints",
        }
    }
}

// =============================================================================
// INDEX & METADATA FILES
// =============================================================================

/// JSON sibling of each period file; serves O(1) duplicate and range checks
/// without opening the binary file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFile {
    pub period: String,
    pub pattern: String,
    pub count: u64,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    pub symbol: String,
    pub interval: String,
}

impl IndexFile {
    fn load(path: &Path) -> Option<Self> {
        let data = std::fs::read(path).ok()?;
        serde_json::from_slice(&data).ok()
    }

    fn store(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write index {}", path.display()))
    }
}

/// Rollup written per interval directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntervalMetadata {
    pub symbol: String,
    pub interval: String,
    pub data_kind: String,
    pub period_count: u64,
    pub total_records: u64,
    pub last_updated_ms: i64,
}

// =============================================================================
// RECENT-TIMESTAMPS CACHE
// =============================================================================

const RECENT_CAP: usize = 1_000;

/// Per-period set of recently saved open-times. When full, the oldest half
/// is evicted in insertion order.
#[derive(Debug, Default)]
struct RecentTimestamps {
    set: HashSet<i64>,
    order: VecDeque<i64>,
}

impl RecentTimestamps {
    fn contains(&self, ts: i64) -> bool {
        self.set.contains(&ts)
    }

    fn insert(&mut self, ts: i64) {
        if !self.set.insert(ts) {
            return;
        }
        self.order.push_back(ts);
        if self.order.len() > RECENT_CAP {
            for _ in 0..RECENT_CAP / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }
}

// =============================================================================
// STATS
// =============================================================================

#[derive(Debug, Default)]
pub struct StoreStats {
    pub candles_written: AtomicU64,
    pub footprints_written: AtomicU64,
    pub duplicates_suppressed: AtomicU64,
    pub validation_failures: AtomicU64,
    pub files_created: AtomicU64,
}

impl StoreStats {
    pub fn summary(&self) -> String {
        format!(
            "candles={} footprints={} duplicates={} validation_failures={} files_created={}",
            self.candles_written.load(Ordering::Relaxed),
            self.footprints_written.load(Ordering::Relaxed),
            self.duplicates_suppressed.load(Ordering::Relaxed),
            self.validation_failures.load(Ordering::Relaxed),
            self.files_created.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// QUERIES
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreQuery {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedCandles {
    pub candles: Vec<FootprintCandle>,
    pub page: usize,
    pub page_size: usize,
    pub total_count: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    Duplicate,
}

// =============================================================================
// STORE
// =============================================================================

pub struct FootprintFileStore {
    base_dir: PathBuf,
    write_metadata: bool,
    recent: Mutex<HashMap<String, RecentTimestamps>>,
    pub stats: StoreStats,
}

impl FootprintFileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_metadata: true,
            recent: Mutex::new(HashMap::new()),
            stats: StoreStats::default(),
        }
    }

    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.write_metadata = enabled;
        self
    }

    fn kind_dir(&self, venue: Venue, symbol: &str, kind: DataKind, interval: Interval) -> PathBuf {
        self.base_dir
            .join(venue.as_str())
            .join(symbol)
            .join(kind.as_str())
            .join(interval.as_str())
    }

    /// Persist a completed candle. Duplicates are success; validation
    /// failures are fatal for this candle and nothing is written.
    pub fn save(&self, candle: &FootprintCandle) -> IngestResult<SaveOutcome> {
        if let Err(e) = codec::validate(candle) {
            self.stats.validation_failures.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let part = partition::partition_for(candle.interval, candle.open_time);
        let candles_dir = self.kind_dir(candle.venue, &candle.symbol, DataKind::Candles, candle.interval);
        let cache_key = format!("{}/{}", candles_dir.display(), part.period);

        {
            let mut recent = self.recent.lock();
            let entry = recent.entry(cache_key.clone()).or_default();
            if entry.contains(candle.open_time) {
                self.stats.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
                return Ok(SaveOutcome::Duplicate);
            }

            let idx_path = candles_dir.join(format!("{}.idx", part.period));
            if let Some(idx) = IndexFile::load(&idx_path) {
                if idx.count > 0
                    && candle.open_time >= idx.first_timestamp
                    && candle.open_time <= idx.last_timestamp
                {
                    // Probable duplicate; anything above last_timestamp is
                    // definitely new and skips this check.
                    entry.insert(candle.open_time);
                    self.stats.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
                    return Ok(SaveOutcome::Duplicate);
                }
            }

            // Insert before writing to close the race between concurrent
            // saves of the same key.
            entry.insert(candle.open_time);
        }

        self.write_record(candle, &part, DataKind::Candles)
            .map_err(|e| IngestError::Storage(format!("{e:#}")))?;
        self.stats.candles_written.fetch_add(1, Ordering::Relaxed);

        if !candle.bins.is_empty() {
            self.write_record(candle, &part, DataKind::Footprints)
                .map_err(|e| IngestError::Storage(format!("{e:#}")))?;
            self.stats.footprints_written.fetch_add(1, Ordering::Relaxed);
        }

        Ok(SaveOutcome::Written)
    }

    fn write_record(&self, candle: &FootprintCandle, part: &Partition, kind: DataKind) -> Result<()> {
        let dir = self.kind_dir(candle.venue, &candle.symbol, kind, candle.interval);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let payload = match kind {
            DataKind::Candles => codec::encode_candle_only(candle)?,
            DataKind::Footprints => codec::encode_footprint_only(candle)?,
        };

        let bin_path = dir.join(format!("{}.bin", part.period));
        let existed = bin_path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&bin_path)
            .with_context(|| format!("failed to open {}", bin_path.display()))?;

        let mut header = if existed {
            self.read_or_rebuild_header(&mut file, &bin_path, candle)?
        } else {
            let header = PeriodFileHeader::new(&candle.symbol, candle.interval);
            file.write_all(&header.encode())?;
            self.stats.files_created.fetch_add(1, Ordering::Relaxed);
            header
        };

        period_file::append_record(&mut file, &payload)?;
        header.note_append(candle.open_time);
        period_file::rewrite_header(&mut file, &header)?;
        file.flush()?;

        let idx = IndexFile {
            period: part.period.clone(),
            pattern: part.pattern.as_str().to_string(),
            count: header.count as u64,
            first_timestamp: header.first_timestamp,
            last_timestamp: header.last_timestamp,
            symbol: candle.symbol.clone(),
            interval: candle.interval.as_str().to_string(),
        };
        idx.store(&dir.join(format!("{}.idx", part.period)))?;

        if self.write_metadata {
            self.update_metadata(&dir, candle, kind)?;
        }
        Ok(())
    }

    fn read_or_rebuild_header(
        &self,
        file: &mut File,
        path: &Path,
        candle: &FootprintCandle,
    ) -> Result<PeriodFileHeader> {
        use std::io::{Read, Seek, SeekFrom};
        let mut buf = [0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        match file.read_exact(&mut buf).ok().and_then(|_| PeriodFileHeader::decode(&buf).ok()) {
            Some(header) => Ok(header),
            None => {
                // Unreadable header on an existing file: fall back to a scan.
                warn!(path = %path.display(), "rebuilding period file header from scan");
                let contents =
                    period_file::read_period_file(path, candle.venue, &candle.symbol, candle.interval)?;
                let mut header = PeriodFileHeader::new(&candle.symbol, candle.interval);
                for r in &contents.records {
                    header.note_append(r.open_time());
                }
                Ok(header)
            }
        }
    }

    fn update_metadata(&self, dir: &Path, candle: &FootprintCandle, kind: DataKind) -> Result<()> {
        let meta_path = dir.join("metadata.json");
        let mut meta: IntervalMetadata = std::fs::read(&meta_path)
            .ok()
            .and_then(|d| serde_json::from_slice(&d).ok())
            .unwrap_or_default();

        meta.symbol = candle.symbol.clone();
        meta.interval = candle.interval.as_str().to_string();
        meta.data_kind = kind.as_str().to_string();
        meta.total_records += 1;
        meta.period_count = count_period_files(dir);
        meta.last_updated_ms = chrono::Utc::now().timestamp_millis();

        std::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)
            .with_context(|| format!("failed to write {}", meta_path.display()))
    }

    // -------------------------------------------------------------------------
    // QUERY PATHS
    // -------------------------------------------------------------------------

    /// Candles (no aggregations) for a symbol, ascending by open time.
    pub fn find_by_symbol(
        &self,
        symbol: &str,
        venue: Venue,
        interval: Interval,
        query: StoreQuery,
    ) -> Result<Vec<FootprintCandle>> {
        let dir = self.kind_dir(venue, symbol, DataKind::Candles, interval);
        let mut out = Vec::new();

        for (bin_path, _idx) in self.select_periods(&dir, &query)? {
            let contents = period_file::read_period_file(&bin_path, venue, symbol, interval)?;
            for record in contents.records {
                let candle = match record {
                    DecodedRecord::CandleOnly(r) => r.into_candle(venue, symbol, interval),
                    DecodedRecord::Full(c) | DecodedRecord::LegacyJson(c) => c,
                    DecodedRecord::FootprintOnly(_) => continue,
                };
                if let Some(start) = query.start_time {
                    if candle.open_time < start {
                        continue;
                    }
                }
                if let Some(end) = query.end_time {
                    if candle.open_time > end {
                        continue;
                    }
                }
                out.push(candle);
            }
            if let Some(limit) = query.limit {
                if out.len() >= limit {
                    out.sort_by_key(|c| c.open_time);
                    out.truncate(limit);
                    return Ok(out);
                }
            }
        }

        out.sort_by_key(|c| c.open_time);
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Candles joined with their footprint aggregations by open time.
    /// Candles without a footprint record come back with empty bins.
    pub fn find_with_footprint(
        &self,
        symbol: &str,
        venue: Venue,
        interval: Interval,
        query: StoreQuery,
    ) -> Result<Vec<FootprintCandle>> {
        let mut candles = self.find_by_symbol(symbol, venue, interval, query)?;
        if candles.is_empty() {
            return Ok(candles);
        }

        let range = StoreQuery {
            start_time: Some(candles.first().map(|c| c.open_time).unwrap_or(0)),
            end_time: Some(candles.last().map(|c| c.open_time).unwrap_or(0)),
            limit: None,
        };
        let dir = self.kind_dir(venue, symbol, DataKind::Footprints, interval);
        let mut bins_by_open: HashMap<i64, std::collections::BTreeMap<i64, crate::models::PriceBin>> =
            HashMap::new();
        for (bin_path, _idx) in self.select_periods(&dir, &range)? {
            let contents = period_file::read_period_file(&bin_path, venue, symbol, interval)?;
            for record in contents.records {
                match record {
                    DecodedRecord::FootprintOnly(r) => {
                        bins_by_open.insert(r.open_time, r.bins);
                    }
                    DecodedRecord::Full(c) | DecodedRecord::LegacyJson(c) => {
                        bins_by_open.insert(c.open_time, c.bins);
                    }
                    DecodedRecord::CandleOnly(_) => {}
                }
            }
        }

        for candle in &mut candles {
            if let Some(bins) = bins_by_open.remove(&candle.open_time) {
                candle.bins = bins;
            }
        }
        Ok(candles)
    }

    /// The single most recent candle, located through the `.idx` with the
    /// greatest last timestamp.
    pub fn find_latest(
        &self,
        symbol: &str,
        venue: Venue,
        interval: Interval,
    ) -> Result<Option<FootprintCandle>> {
        let dir = self.kind_dir(venue, symbol, DataKind::Candles, interval);
        let indexes = self.list_indexes(&dir)?;
        let Some((best_path, _)) = indexes
            .into_iter()
            .max_by_key(|(_, idx)| idx.last_timestamp)
        else {
            return Ok(None);
        };

        let bin_path = best_path.with_extension("bin");
        let contents = period_file::read_period_file(&bin_path, venue, symbol, interval)?;
        let mut latest: Option<FootprintCandle> = None;
        for record in contents.records {
            let candle = match record {
                DecodedRecord::CandleOnly(r) => r.into_candle(venue, symbol, interval),
                DecodedRecord::Full(c) | DecodedRecord::LegacyJson(c) => c,
                DecodedRecord::FootprintOnly(_) => continue,
            };
            if latest.as_ref().map(|l| candle.open_time > l.open_time).unwrap_or(true) {
                latest = Some(candle);
            }
        }
        Ok(latest)
    }

    /// Pagination wrapper over `find_with_footprint`. Page numbering starts
    /// at 1.
    pub fn find_paginated(
        &self,
        symbol: &str,
        venue: Venue,
        interval: Interval,
        query: StoreQuery,
        page: usize,
        page_size: usize,
    ) -> Result<PaginatedCandles> {
        let unlimited = StoreQuery {
            limit: None,
            ..query
        };
        let all = self.find_with_footprint(symbol, venue, interval, unlimited)?;
        let total_count = all.len();
        let page_size = page_size.max(1);
        let total_pages = total_count.div_ceil(page_size);
        let page = page.max(1);
        let start = (page - 1) * page_size;
        let candles = if start >= total_count {
            Vec::new()
        } else {
            all[start..(start + page_size).min(total_count)].to_vec()
        };
        Ok(PaginatedCandles {
            candles,
            page,
            page_size,
            total_count,
            total_pages,
        })
    }

    // -------------------------------------------------------------------------
    // PERIOD ENUMERATION
    // -------------------------------------------------------------------------

    fn list_indexes(&self, dir: &Path) -> Result<Vec<(PathBuf, IndexFile)>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Ok(out), // No data yet for this stream.
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "idx").unwrap_or(false) {
                if let Some(idx) = IndexFile::load(&path) {
                    out.push((path, idx));
                }
            }
        }
        out.sort_by(|a, b| a.1.first_timestamp.cmp(&b.1.first_timestamp));
        Ok(out)
    }

    /// Period files overlapping the query window, ascending. Files without a
    /// readable index are included conservatively.
    fn select_periods(&self, dir: &Path, query: &StoreQuery) -> Result<Vec<(PathBuf, Option<IndexFile>)>> {
        let mut selected: Vec<(PathBuf, Option<IndexFile>)> = Vec::new();
        let mut indexed: HashSet<PathBuf> = HashSet::new();

        for (idx_path, idx) in self.list_indexes(dir)? {
            let bin_path = idx_path.with_extension("bin");
            indexed.insert(bin_path.clone());
            if let Some(start) = query.start_time {
                if idx.count > 0 && idx.last_timestamp < start {
                    continue;
                }
            }
            if let Some(end) = query.end_time {
                if idx.count > 0 && idx.first_timestamp > end {
                    continue;
                }
            }
            if bin_path.exists() {
                selected.push((bin_path, Some(idx)));
            }
        }

        // Orphan .bin files (lost index): read them rather than miss data.
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map(|e| e == "bin").unwrap_or(false) && !indexed.contains(&path) {
                    debug!(path = %path.display(), "period file without index included in scan");
                    selected.push((path, None));
                }
            }
        }

        selected.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(selected)
    }
}

fn count_period_files(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().extension().map(|x| x == "bin").unwrap_or(false))
                .count() as u64
        })
        .unwrap_or(0)
}
