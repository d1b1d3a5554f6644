//! Core domain types: venues, intervals, trades, symbol configuration and
//! footprint candles.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// VENUE
// =============================================================================

/// Supported futures venues. A closed set selected by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Venue {
    Binance,
    Bybit,
    Okx,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "BINANCE",
            Self::Bybit => "BYBIT",
            Self::Okx => "OKX",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BINANCE" => Some(Self::Binance),
            "BYBIT" => Some(Self::Bybit),
            "OKX" => Some(Self::Okx),
            _ => None,
        }
    }

    /// Venues that hard-close WebSocket connections after 24h and therefore
    /// need zero-gap rotation.
    pub fn needs_rotation(&self) -> bool {
        matches!(self, Self::Binance)
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// INTERVAL
// =============================================================================

/// Candle intervals. Period-file granularity depends on the interval so that
/// files stay within a practical record count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
}

impl Interval {
    pub const ALL: [Interval; 11] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H8,
        Self::H12,
        Self::D1,
    ];

    pub fn secs(&self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M3 => 180,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H2 => 7_200,
            Self::H4 => 14_400,
            Self::H8 => 28_800,
            Self::H12 => 43_200,
            Self::D1 => 86_400,
        }
    }

    #[inline]
    pub fn ms(&self) -> i64 {
        self.secs() * 1_000
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "3m" => Some(Self::M3),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "30m" => Some(Self::M30),
            "1h" => Some(Self::H1),
            "2h" => Some(Self::H2),
            "4h" => Some(Self::H4),
            "8h" => Some(Self::H8),
            "12h" => Some(Self::H12),
            "1d" => Some(Self::D1),
            _ => None,
        }
    }

    /// Floor a millisecond timestamp onto this interval's grid.
    #[inline]
    pub fn align(&self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.ms())
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SYMBOL CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolStatus {
    PendingReview,
    Active,
    Delisted,
    Disabled,
}

/// Per-symbol parameters the aggregator needs: tick geometry, precision and
/// the bin multiplier that widens histogram bins for high-priced symbols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub venue: Venue,
    pub symbol: String,
    pub tick_value: f64,
    pub quantity_precision: u32,
    pub price_precision: u32,
    /// Integer >= 1 mapping a tick to a histogram bin.
    pub bin_multiplier: u32,
    pub active: bool,
    pub status: SymbolStatus,
}

impl SymbolConfig {
    pub fn new(venue: Venue, symbol: impl Into<String>, tick_value: f64) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
            tick_value,
            quantity_precision: 8,
            price_precision: 8,
            bin_multiplier: 1,
            active: true,
            status: SymbolStatus::Active,
        }
    }

    pub fn with_bin_multiplier(mut self, multiplier: u32) -> Self {
        self.bin_multiplier = multiplier.max(1);
        self
    }

    /// Width of one histogram bin in price units.
    #[inline]
    pub fn bin_width(&self) -> f64 {
        self.tick_value * self.bin_multiplier.max(1) as f64
    }
}

// =============================================================================
// TRADE
// =============================================================================

/// A normalized venue trade. Within one (venue, symbol) stream trade ids are
/// strictly increasing; any gap triggers recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub venue: Venue,
    pub symbol: String,
    pub trade_id: u64,
    /// Venue event timestamp (ms).
    pub event_time: i64,
    /// Trade execution timestamp (ms). Drives interval assignment.
    pub trade_time: i64,
    pub price: f64,
    /// Venue decimal string, preserved for audit.
    pub price_raw: String,
    pub quantity: f64,
    /// true when the buyer was the passive side (sell aggression).
    pub is_buyer_maker: bool,
}

impl Trade {
    #[inline]
    pub fn quote_value(&self) -> f64 {
        self.price * self.quantity
    }

    /// Histogram bin index for the given symbol geometry. Computed in integer
    /// tick space to avoid float drift at bin borders.
    #[inline]
    pub fn bin_index(&self, tick_value: f64, bin_multiplier: u32) -> i64 {
        price_bin_index(self.price, tick_value, bin_multiplier)
    }
}

/// `floor(price / (tick * multiplier))`, evaluated as integer ticks so that
/// e.g. 100.1 / 0.1 lands in bin 1001 rather than 1000.
#[inline]
pub fn price_bin_index(price: f64, tick_value: f64, bin_multiplier: u32) -> i64 {
    let ticks = (price / tick_value).round() as i64;
    ticks.div_euclid(bin_multiplier.max(1) as i64)
}

/// A detected hole in a trade-id stream: ids in `(after, before)` exclusive
/// were never delivered and are candidates for REST recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeGap {
    pub start_id: u64,
    pub end_id: u64,
}

impl TradeGap {
    /// Number of missing ids in the open interval.
    pub fn missing(&self) -> u64 {
        self.end_id.saturating_sub(self.start_id).saturating_sub(1)
    }
}

// =============================================================================
// FOOTPRINT CANDLE
// =============================================================================

/// Per-price-bin volume distribution, split by aggressor side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceBin {
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub buy_quote: f64,
    pub sell_quote: f64,
}

/// A time-interval OHLCV bar augmented with a histogram of volume per price
/// bin. Exclusively owned by the worker shard its symbol maps to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintCandle {
    pub venue: Venue,
    pub symbol: String,
    pub interval: Interval,
    pub open_time: i64,
    /// 0 while open; `open_time + interval_ms - 1` once complete.
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub quote_volume: f64,
    pub buy_quote: f64,
    pub sell_quote: f64,
    /// buy_volume - sell_volume.
    pub delta: f64,
    /// Running minimum of delta across the life of the candle.
    pub delta_min: f64,
    /// Running maximum of delta across the life of the candle.
    pub delta_max: f64,
    pub trade_count: u64,
    pub first_trade_id: u64,
    pub last_trade_id: u64,
    pub complete: bool,
    pub bins: BTreeMap<i64, PriceBin>,
}

impl FootprintCandle {
    pub fn new(venue: Venue, symbol: impl Into<String>, interval: Interval, open_time: i64) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
            interval,
            open_time,
            close_time: 0,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            quote_volume: 0.0,
            buy_quote: 0.0,
            sell_quote: 0.0,
            delta: 0.0,
            delta_min: 0.0,
            delta_max: 0.0,
            trade_count: 0,
            first_trade_id: 0,
            last_trade_id: 0,
            complete: false,
            bins: BTreeMap::new(),
        }
    }

    /// Fold one trade into the candle. Caller guarantees the trade belongs to
    /// this candle's interval slot and passed deduplication.
    pub fn apply_trade(&mut self, trade: &Trade, tick_value: f64, bin_multiplier: u32) {
        let qty = trade.quantity;
        let quote = trade.quote_value();
        // Aggressive buy when the buyer was NOT the maker.
        let is_buy = !trade.is_buyer_maker;

        if self.trade_count == 0 {
            self.open = trade.price;
            self.high = trade.price;
            self.low = trade.price;
            self.first_trade_id = trade.trade_id;
        } else {
            if trade.price > self.high {
                self.high = trade.price;
            }
            if trade.price < self.low {
                self.low = trade.price;
            }
        }
        self.close = trade.price;

        self.volume += qty;
        self.quote_volume += quote;
        if is_buy {
            self.buy_volume += qty;
            self.buy_quote += quote;
            self.delta += qty;
        } else {
            self.sell_volume += qty;
            self.sell_quote += quote;
            self.delta -= qty;
        }
        if self.delta > self.delta_max {
            self.delta_max = self.delta;
        }
        if self.delta < self.delta_min {
            self.delta_min = self.delta;
        }

        let bin = self.bins.entry(trade.bin_index(tick_value, bin_multiplier)).or_default();
        bin.volume += qty;
        if is_buy {
            bin.buy_volume += qty;
            bin.buy_quote += quote;
        } else {
            bin.sell_volume += qty;
            bin.sell_quote += quote;
        }

        self.trade_count += 1;
        self.last_trade_id = trade.trade_id;
    }

    /// Seal the candle: stamp close_time and the complete flag.
    pub fn finalize(&mut self) {
        self.close_time = self.open_time + self.interval.ms() - 1;
        self.complete = true;
    }

    /// Key identifying this candle across the system.
    pub fn key(&self) -> (Venue, &str, Interval, i64) {
        (self.venue, self.symbol.as_str(), self.interval, self.open_time)
    }

    pub fn open_time_utc(&self) -> chrono::DateTime<Utc> {
        Utc.timestamp_millis_opt(self.open_time).single().unwrap_or_default()
    }
}

// =============================================================================
// APPLICATION CONFIGURATION
// =============================================================================

/// Process-level configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root directory for period files.
    pub data_dir: String,
    pub log_dir: String,
    /// Unix-domain socket the persistence sidecar listens on.
    pub sidecar_socket_path: String,
    /// SQLite database owned by the sidecar process.
    pub sidecar_db_path: String,
    /// Worker count; defaults to machine parallelism.
    pub worker_count: usize,
    /// Seconds between dirty-state flushes to the sidecar.
    pub flush_interval_secs: u64,
    /// Bounded inbound trade channel capacity.
    pub trade_channel_capacity: usize,
    /// Intervals the aggregator builds.
    pub intervals: Vec<Interval>,
    /// false = append-only period files; true = SQLite-backed store (external).
    pub use_database: bool,
    /// Write metadata.json next to each interval directory.
    pub write_metadata: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            log_dir: "./logs".to_string(),
            sidecar_socket_path: "./flowtrace-sidecar.sock".to_string(),
            sidecar_db_path: "./flowtrace-state.db".to_string(),
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            flush_interval_secs: 30,
            trade_channel_capacity: 4_096,
            intervals: Interval::ALL.to_vec(),
            use_database: false,
            write_metadata: true,
        }
    }
}

impl AppConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Ok(v) = std::env::var("FLOWTRACE_DATA_DIR") {
            config.data_dir = v;
        }
        if let Ok(v) = std::env::var("FLOWTRACE_LOG_DIR") {
            config.log_dir = v;
        }
        if let Ok(v) = std::env::var("FLOWTRACE_SOCKET_PATH") {
            config.sidecar_socket_path = v;
        }
        if let Ok(v) = std::env::var("FLOWTRACE_STATE_DB") {
            config.sidecar_db_path = v;
        }
        if let Ok(v) = std::env::var("FLOWTRACE_WORKER_COUNT") {
            config.worker_count = v.parse().unwrap_or(config.worker_count);
        }
        if let Ok(v) = std::env::var("FLOWTRACE_FLUSH_INTERVAL_SECS") {
            config.flush_interval_secs = v.parse().unwrap_or(config.flush_interval_secs);
        }
        if let Ok(v) = std::env::var("FLOWTRACE_TRADE_CHANNEL_CAPACITY") {
            config.trade_channel_capacity = v.parse().unwrap_or(config.trade_channel_capacity);
        }
        if let Ok(v) = std::env::var("FLOWTRACE_INTERVALS") {
            let parsed: Vec<Interval> = v.split(',').filter_map(|s| Interval::from_str(s.trim())).collect();
            if !parsed.is_empty() {
                config.intervals = parsed;
            }
        }
        if let Ok(v) = std::env::var("FLOWTRACE_USE_DATABASE") {
            config.use_database = v == "1" || v.eq_ignore_ascii_case("true");
        }

        config.worker_count = config.worker_count.max(1);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(id: u64, ts: i64, price: f64, qty: f64, maker: bool) -> Trade {
        Trade {
            venue: Venue::Binance,
            symbol: "BTCUSDT".to_string(),
            trade_id: id,
            event_time: ts,
            trade_time: ts,
            price,
            price_raw: format!("{}", price),
            quantity: qty,
            is_buyer_maker: maker,
        }
    }

    #[test]
    fn interval_alignment() {
        assert_eq!(Interval::M1.align(1_699_999_980_000), 1_699_999_980_000);
        assert_eq!(Interval::M1.align(1_700_000_030_500), 1_699_999_980_000);
        assert_eq!(Interval::M1.align(1_700_000_040_000) % 60_000, 0);
        assert_eq!(Interval::D1.align(1_700_000_000_000) % 86_400_000, 0);
    }

    #[test]
    fn bin_index_integer_space() {
        // 100.1 / 0.1 is 1000.999… in floats; integer tick space must give 1001.
        assert_eq!(price_bin_index(100.1, 0.1, 1), 1001);
        assert_eq!(price_bin_index(100.0, 0.1, 1), 1000);
        assert_eq!(price_bin_index(100.2, 0.1, 1), 1002);
        assert_eq!(price_bin_index(100.2, 0.1, 5), 200);
    }

    #[test]
    fn single_candle_trajectory() {
        // Three trades; running delta goes +1, then -1, then 0.
        let mut c = FootprintCandle::new(Venue::Binance, "BTCUSDT", Interval::M1, 1_700_000_000_000);
        c.apply_trade(&trade(1, 1_700_000_000_500, 100.0, 1.0, false), 0.1, 1);
        c.apply_trade(&trade(2, 1_700_000_030_000, 100.2, 2.0, true), 0.1, 1);
        c.apply_trade(&trade(3, 1_700_000_059_999, 100.1, 1.0, false), 0.1, 1);
        c.finalize();

        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 100.2);
        assert_eq!(c.low, 100.0);
        assert_eq!(c.close, 100.1);
        assert_eq!(c.volume, 4.0);
        assert_eq!(c.buy_volume, 2.0);
        assert_eq!(c.sell_volume, 2.0);
        assert_eq!(c.delta, 0.0);
        assert_eq!(c.delta_max, 1.0);
        assert_eq!(c.delta_min, -1.0);
        assert_eq!(c.first_trade_id, 1);
        assert_eq!(c.last_trade_id, 3);
        assert_eq!(c.close_time, 1_700_000_000_000 + 60_000 - 1);
        assert!(c.complete);

        assert_eq!(c.bins.len(), 3);
        let b1000 = &c.bins[&1000];
        assert_eq!(b1000.volume, 2.0);
        assert_eq!(b1000.buy_volume, 2.0);
        let b1002 = &c.bins[&1002];
        assert_eq!(b1002.sell_volume, 2.0);
        let b1001 = &c.bins[&1001];
        assert_eq!(b1001.buy_volume, 1.0);
    }

    #[test]
    fn volume_and_delta_identity() {
        let mut c = FootprintCandle::new(Venue::Bybit, "ETHUSDT", Interval::M5, 0);
        for i in 0..50u64 {
            let maker = i % 3 == 0;
            c.apply_trade(&trade(i + 1, (i as i64) * 100, 3000.0 + i as f64 * 0.01, 0.3, maker), 0.01, 1);
        }
        assert!((c.volume - (c.buy_volume + c.sell_volume)).abs() < 1e-8);
        assert!((c.delta - (c.buy_volume - c.sell_volume)).abs() < 1e-8);
        let bin_total: f64 = c.bins.values().map(|b| b.volume).sum();
        assert!((bin_total - c.volume).abs() < 1e-8);
    }

    #[test]
    fn venue_and_interval_tags_round_trip() {
        for v in [Venue::Binance, Venue::Bybit, Venue::Okx] {
            assert_eq!(Venue::from_str(v.as_str()), Some(v));
        }
        for i in Interval::ALL {
            assert_eq!(Interval::from_str(i.as_str()), Some(i));
        }
    }
}
