//! Record codecs for period files.
//!
//! Every record payload starts with a 4-byte magic selecting the codec, then
//! an LZ4 block (length-prepended) holding a bincode body:
//!
//! - `FTCF` full footprint candle (OHLCV + aggregations)
//! - `FTCO` candle-only (OHLCV), written to the candles/ directory
//! - `FTFO` footprint-only (aggregations), written to the footprints/ directory
//!
//! A payload whose first byte is `{` is a line from a legacy newline-delimited
//! JSON file; readers continue to support those.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::IngestError;
use crate::models::{FootprintCandle, Interval, PriceBin, Venue};

pub const MAGIC_FULL: &[u8; 4] = b"FTCF";
pub const MAGIC_CANDLE_ONLY: &[u8; 4] = b"FTCO";
pub const MAGIC_FOOTPRINT_ONLY: &[u8; 4] = b"FTFO";

/// Tolerance for the volume and delta identities.
pub const IDENTITY_TOLERANCE: f64 = 1e-8;

// =============================================================================
// RECORD BODIES
// =============================================================================

/// OHLCV without the per-bin aggregations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub open_time: i64,
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
    pub delta: f64,
    pub delta_min: f64,
    pub delta_max: f64,
    pub trade_count: u64,
    pub first_trade_id: u64,
    pub last_trade_id: u64,
    pub complete: bool,
}

impl CandleRecord {
    pub fn from_candle(c: &FootprintCandle) -> Self {
        Self {
            open_time: c.open_time,
            close_time: c.close_time,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            buy_volume: c.buy_volume,
            sell_volume: c.sell_volume,
            quote_volume: c.quote_volume,
            buy_quote: c.buy_quote,
            sell_quote: c.sell_quote,
            delta: c.delta,
            delta_min: c.delta_min,
            delta_max: c.delta_max,
            trade_count: c.trade_count,
            first_trade_id: c.first_trade_id,
            last_trade_id: c.last_trade_id,
            complete: c.complete,
        }
    }

    /// Rebuild a candle with empty aggregations, keyed by stream context.
    pub fn into_candle(self, venue: Venue, symbol: &str, interval: Interval) -> FootprintCandle {
        FootprintCandle {
            venue,
            symbol: symbol.to_string(),
            interval,
            open_time: self.open_time,
            close_time: self.close_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            quote_volume: self.quote_volume,
            buy_quote: self.buy_quote,
            sell_quote: self.sell_quote,
            delta: self.delta,
            delta_min: self.delta_min,
            delta_max: self.delta_max,
            trade_count: self.trade_count,
            first_trade_id: self.first_trade_id,
            last_trade_id: self.last_trade_id,
            complete: self.complete,
            bins: BTreeMap::new(),
        }
    }
}

/// Aggregations without the OHLCV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintRecord {
    pub open_time: i64,
    pub close_time: i64,
    pub bins: BTreeMap<i64, PriceBin>,
}

impl FootprintRecord {
    pub fn from_candle(c: &FootprintCandle) -> Self {
        Self {
            open_time: c.open_time,
            close_time: c.close_time,
            bins: c.bins.clone(),
        }
    }
}

/// A decoded record payload.
#[derive(Debug, Clone)]
pub enum DecodedRecord {
    Full(FootprintCandle),
    CandleOnly(CandleRecord),
    FootprintOnly(FootprintRecord),
    /// Line from a legacy newline-delimited JSON file.
    LegacyJson(FootprintCandle),
}

impl DecodedRecord {
    pub fn open_time(&self) -> i64 {
        match self {
            Self::Full(c) | Self::LegacyJson(c) => c.open_time,
            Self::CandleOnly(r) => r.open_time,
            Self::FootprintOnly(r) => r.open_time,
        }
    }
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

fn encode_with_magic<T: Serialize>(magic: &[u8; 4], body: &T) -> Result<Vec<u8>> {
    let raw = bincode::serialize(body).context("bincode serialize failed")?;
    let compressed = lz4_flex::compress_prepend_size(&raw);
    let mut payload = Vec::with_capacity(4 + compressed.len());
    payload.extend_from_slice(magic);
    payload.extend_from_slice(&compressed);
    Ok(payload)
}

fn decode_body<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    let raw = lz4_flex::decompress_size_prepended(&payload[4..])
        .context("lz4 decompress failed")?;
    bincode::deserialize(&raw).context("bincode deserialize failed")
}

/// Serialize the full candle (`FTCF`).
pub fn encode_full(candle: &FootprintCandle) -> Result<Vec<u8>> {
    encode_with_magic(MAGIC_FULL, candle)
}

/// Serialize OHLCV only (`FTCO`).
pub fn encode_candle_only(candle: &FootprintCandle) -> Result<Vec<u8>> {
    encode_with_magic(MAGIC_CANDLE_ONLY, &CandleRecord::from_candle(candle))
}

/// Serialize aggregations only (`FTFO`).
pub fn encode_footprint_only(candle: &FootprintCandle) -> Result<Vec<u8>> {
    encode_with_magic(MAGIC_FOOTPRINT_ONLY, &FootprintRecord::from_candle(candle))
}

/// Decode one record payload, dispatching on its magic. Stream context is
/// required to rebuild candles from reduced records and legacy JSON lines.
pub fn decode(payload: &[u8], venue: Venue, symbol: &str, interval: Interval) -> Result<DecodedRecord> {
    if payload.len() < 4 {
        bail!("record payload too short: {} bytes", payload.len());
    }
    if payload[0] == b'{' {
        let candle = decode_legacy_json(payload, venue, symbol, interval)?;
        return Ok(DecodedRecord::LegacyJson(candle));
    }
    let magic: [u8; 4] = payload[..4].try_into().unwrap();
    match &magic {
        MAGIC_FULL => Ok(DecodedRecord::Full(decode_body(payload)?)),
        MAGIC_CANDLE_ONLY => Ok(DecodedRecord::CandleOnly(decode_body(payload)?)),
        MAGIC_FOOTPRINT_ONLY => Ok(DecodedRecord::FootprintOnly(decode_body(payload)?)),
        other => bail!("unknown record magic: {:02X?}", other),
    }
}

// =============================================================================
// LEGACY JSON
// =============================================================================

/// Legacy line shape: a full candle object with camelCase keys. Missing
/// fields default so partially-written historical lines still load.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LegacyCandle {
    open_time: i64,
    close_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    buy_volume: f64,
    sell_volume: f64,
    quote_volume: f64,
    buy_quote: f64,
    sell_quote: f64,
    delta: f64,
    delta_min: f64,
    delta_max: f64,
    trade_count: u64,
    first_trade_id: u64,
    last_trade_id: u64,
    complete: bool,
    bins: BTreeMap<i64, PriceBin>,
}

fn decode_legacy_json(
    line: &[u8],
    venue: Venue,
    symbol: &str,
    interval: Interval,
) -> Result<FootprintCandle> {
    let legacy: LegacyCandle =
        serde_json::from_slice(line).context("legacy JSON candle parse failed")?;
    Ok(FootprintCandle {
        venue,
        symbol: symbol.to_string(),
        interval,
        open_time: legacy.open_time,
        close_time: legacy.close_time,
        open: legacy.open,
        high: legacy.high,
        low: legacy.low,
        close: legacy.close,
        volume: legacy.volume,
        buy_volume: legacy.buy_volume,
        sell_volume: legacy.sell_volume,
        quote_volume: legacy.quote_volume,
        buy_quote: legacy.buy_quote,
        sell_quote: legacy.sell_quote,
        delta: legacy.delta,
        delta_min: legacy.delta_min,
        delta_max: legacy.delta_max,
        trade_count: legacy.trade_count,
        first_trade_id: legacy.first_trade_id,
        last_trade_id: legacy.last_trade_id,
        complete: legacy.complete,
        bins: legacy.bins,
    })
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Check every candle invariant; collect all violations rather than stopping
/// at the first so the rejection can list them.
pub fn validate(candle: &FootprintCandle) -> Result<(), IngestError> {
    let mut rules: Vec<String> = Vec::new();

    if candle.trade_count > 0 {
        if candle.low > candle.open || candle.open > candle.high {
            rules.push(format!(
                "OHLC ordering violated: low={} open={} high={}",
                candle.low, candle.open, candle.high
            ));
        }
        if candle.low > candle.close || candle.close > candle.high {
            rules.push(format!(
                "OHLC ordering violated: low={} close={} high={}",
                candle.low, candle.close, candle.high
            ));
        }
    }

    let volume_err = (candle.volume - (candle.buy_volume + candle.sell_volume)).abs();
    if volume_err >= IDENTITY_TOLERANCE {
        rules.push(format!(
            "volume identity violated: volume={} buy+sell={}",
            candle.volume,
            candle.buy_volume + candle.sell_volume
        ));
    }

    let delta_err = (candle.delta - (candle.buy_volume - candle.sell_volume)).abs();
    if delta_err >= IDENTITY_TOLERANCE {
        rules.push(format!(
            "delta identity violated: delta={} buy-sell={}",
            candle.delta,
            candle.buy_volume - candle.sell_volume
        ));
    }

    if candle.open_time != candle.interval.align(candle.open_time) {
        rules.push(format!(
            "open_time {} not aligned to {} grid",
            candle.open_time, candle.interval
        ));
    }

    if candle.complete {
        let expected_close = candle.open_time + candle.interval.ms() - 1;
        if candle.close_time != expected_close {
            rules.push(format!(
                "close_time {} != open_time + interval - 1 ({})",
                candle.close_time, expected_close
            ));
        }
    }

    if rules.is_empty() {
        Ok(())
    } else {
        Err(IngestError::validation(rules))
    }
}
