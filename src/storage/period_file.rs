//! Period file container: 64-byte header plus length-prefixed records.
//!
//! Header layout (little-endian):
//! ```text
//! Offset  Size  Field
//! 0       4     magic "FTCD"
//! 4       2     version (1)
//! 6       2     record_size (0 = variable)
//! 8       4     count
//! 12      8     first_timestamp (ms)
//! 20      8     last_timestamp (ms)
//! 28      16    symbol (UTF-8, zero-padded)
//! 44      8     interval (UTF-8, zero-padded)
//! 52      12    reserved
//! Total: 64 bytes
//! ```
//!
//! A crash between record append and header update leaves the file readable
//! with a stale count; readers scan to EOF rather than trusting the header.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::models::{Interval, Venue};
use crate::storage::codec::{self, DecodedRecord};

pub const HEADER_MAGIC: &[u8; 4] = b"FTCD";
pub const HEADER_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 64;

// =============================================================================
// HEADER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodFileHeader {
    pub version: u16,
    /// 0 = variable-length records.
    pub record_size: u16,
    pub count: u32,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    pub symbol: String,
    pub interval: String,
}

impl PeriodFileHeader {
    pub fn new(symbol: &str, interval: Interval) -> Self {
        Self {
            version: HEADER_VERSION,
            record_size: 0,
            count: 0,
            first_timestamp: 0,
            last_timestamp: 0,
            symbol: symbol.to_string(),
            interval: interval.as_str().to_string(),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(HEADER_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.record_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..20].copy_from_slice(&self.first_timestamp.to_le_bytes());
        buf[20..28].copy_from_slice(&self.last_timestamp.to_le_bytes());
        write_padded(&mut buf[28..44], &self.symbol);
        write_padded(&mut buf[44..52], &self.interval);
        // bytes 52..64 reserved
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            bail!("period file header truncated: {} bytes", buf.len());
        }
        if &buf[0..4] != HEADER_MAGIC {
            bail!("bad period file magic: {:02X?}", &buf[0..4]);
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != HEADER_VERSION {
            bail!("unsupported period file version: {}", version);
        }
        Ok(Self {
            version,
            record_size: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            count: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            first_timestamp: i64::from_le_bytes(buf[12..20].try_into().unwrap()),
            last_timestamp: i64::from_le_bytes(buf[20..28].try_into().unwrap()),
            symbol: read_padded(&buf[28..44]),
            interval: read_padded(&buf[44..52]),
        })
    }

    /// Fold a new record timestamp into the header counters.
    pub fn note_append(&mut self, ts_ms: i64) {
        if self.count == 0 {
            self.first_timestamp = ts_ms;
            self.last_timestamp = ts_ms;
        } else {
            if ts_ms < self.first_timestamp {
                self.first_timestamp = ts_ms;
            }
            if ts_ms > self.last_timestamp {
                self.last_timestamp = ts_ms;
            }
        }
        self.count = self.count.saturating_add(1);
    }
}

fn write_padded(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

fn read_padded(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

// =============================================================================
// RECORD FRAMING
// =============================================================================

/// Append one `u32 length | payload` record at the current end of file.
pub fn append_record(file: &mut File, payload: &[u8]) -> Result<()> {
    file.seek(SeekFrom::End(0))?;
    let len = payload.len() as u32;
    file.write_all(&len.to_le_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

/// Rewrite the 64-byte header in place.
pub fn rewrite_header(file: &mut File, header: &PeriodFileHeader) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.encode())?;
    Ok(())
}

// =============================================================================
// READING
// =============================================================================

/// Everything a period file holds, after a tolerant scan.
#[derive(Debug)]
pub struct PeriodFileContents {
    /// None for legacy JSON files.
    pub header: Option<PeriodFileHeader>,
    pub records: Vec<DecodedRecord>,
}

/// Read a whole period file. Binary files are scanned to EOF regardless of
/// the header count; a truncated trailing record is dropped. A leading `{`
/// byte switches to the legacy newline-delimited JSON reader.
pub fn read_period_file(
    path: &Path,
    venue: Venue,
    symbol: &str,
    interval: Interval,
) -> Result<PeriodFileContents> {
    let mut data = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut data))
        .with_context(|| format!("failed to read period file {}", path.display()))?;

    if data.first() == Some(&b'{') {
        return read_legacy_json(&data, venue, symbol, interval);
    }

    let header = PeriodFileHeader::decode(&data)?;
    let mut records = Vec::with_capacity(header.count as usize);
    let mut offset = HEADER_SIZE;

    while offset + 4 <= data.len() {
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let start = offset + 4;
        let end = start + len;
        if len == 0 || end > data.len() {
            // Partial tail from an interrupted append.
            tracing::warn!(
                path = %path.display(),
                offset,
                "truncated record at end of period file"
            );
            break;
        }
        match codec::decode(&data[start..end], venue, symbol, interval) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), offset, error = %e, "skipping undecodable record");
            }
        }
        offset = end;
    }

    if header.count as usize != records.len() {
        tracing::debug!(
            path = %path.display(),
            header_count = header.count,
            scanned = records.len(),
            "header count disagrees with scan"
        );
    }

    Ok(PeriodFileContents {
        header: Some(header),
        records,
    })
}

fn read_legacy_json(
    data: &[u8],
    venue: Venue,
    symbol: &str,
    interval: Interval,
) -> Result<PeriodFileContents> {
    let mut records = Vec::new();
    for line in data.split(|&b| b == b'\n') {
        let line = trim_ascii(line);
        if line.is_empty() {
            continue;
        }
        match codec::decode(line, venue, symbol, interval) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(error = %e, "skipping unparsable legacy JSON line"),
        }
    }
    Ok(PeriodFileContents {
        header: None,
        records,
    })
}

fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let Some((first, rest)) = s.split_first() {
        if first.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    while let Some((last, rest)) = s.split_last() {
        if last.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FootprintCandle;
    use std::fs::OpenOptions;

    fn candle(open_time: i64) -> FootprintCandle {
        let mut c = FootprintCandle::new(Venue::Binance, "BTCUSDT", Interval::M1, open_time);
        let t = crate::models::Trade {
            venue: Venue::Binance,
            symbol: "BTCUSDT".to_string(),
            trade_id: 1,
            event_time: open_time,
            trade_time: open_time + 10,
            price: 100.0,
            price_raw: "100.0".to_string(),
            quantity: 1.0,
            is_buyer_maker: false,
        };
        c.apply_trade(&t, 0.1, 1);
        c.finalize();
        c
    }

    #[test]
    fn header_round_trip() {
        let mut header = PeriodFileHeader::new("BTCUSDT", Interval::M5);
        header.note_append(1_700_000_000_000);
        header.note_append(1_700_000_300_000);
        header.note_append(1_699_999_700_000);

        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        let decoded = PeriodFileHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.count, 3);
        assert_eq!(decoded.first_timestamp, 1_699_999_700_000);
        assert_eq!(decoded.last_timestamp, 1_700_000_300_000);
        assert_eq!(decoded.symbol, "BTCUSDT");
        assert_eq!(decoded.interval, "5m");
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut buf = PeriodFileHeader::new("X", Interval::M1).encode();
        buf[0] = b'Z';
        assert!(PeriodFileHeader::decode(&buf).is_err());
    }

    #[test]
    fn write_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2023-11-14.bin");

        let mut header = PeriodFileHeader::new("BTCUSDT", Interval::M1);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.write_all(&header.encode()).unwrap();

        for i in 0..3 {
            let c = candle(1_700_000_040_000 + i * 60_000);
            let payload = crate::storage::codec::encode_candle_only(&c).unwrap();
            append_record(&mut file, &payload).unwrap();
            header.note_append(c.open_time);
            rewrite_header(&mut file, &header).unwrap();
        }
        drop(file);

        let contents = read_period_file(&path, Venue::Binance, "BTCUSDT", Interval::M1).unwrap();
        assert_eq!(contents.records.len(), 3);
        let h = contents.header.unwrap();
        assert_eq!(h.count, 3);
        assert_eq!(h.first_timestamp, 1_700_000_040_000);
    }

    #[test]
    fn scan_tolerates_stale_header_and_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2023-11-14.bin");

        let header = PeriodFileHeader::new("BTCUSDT", Interval::M1);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.write_all(&header.encode()).unwrap();

        // Two appends with NO header update (simulated crash), then garbage tail.
        for i in 0..2 {
            let c = candle(1_700_000_040_000 + i * 60_000);
            let payload = crate::storage::codec::encode_full(&c).unwrap();
            append_record(&mut file, &payload).unwrap();
        }
        file.write_all(&1000u32.to_le_bytes()).unwrap();
        file.write_all(b"partial").unwrap();
        drop(file);

        let contents = read_period_file(&path, Venue::Binance, "BTCUSDT", Interval::M1).unwrap();
        assert_eq!(contents.header.as_ref().unwrap().count, 0); // stale
        assert_eq!(contents.records.len(), 2); // scan found them anyway
    }

    #[test]
    fn legacy_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2023-11-14.bin");
        std::fs::write(
            &path,
            "{\"openTime\":1700000040000,\"close\":1.5,\"volume\":1.0,\"buyVolume\":1.0}\n\
             {\"openTime\":1700000100000,\"close\":1.6,\"volume\":2.0,\"buyVolume\":2.0}\n",
        )
        .unwrap();

        let contents = read_period_file(&path, Venue::Binance, "BTCUSDT", Interval::M1).unwrap();
        assert!(contents.header.is_none());
        assert_eq!(contents.records.len(), 2);
        assert_eq!(contents.records[0].open_time(), 1_700_000_040_000);
    }
}
