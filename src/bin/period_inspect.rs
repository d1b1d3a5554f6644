//! Period file inspector: prints the header and a record summary of one
//! `.bin` period file. Useful when a store misbehaves in production.
//!
//! Usage:
//!   cargo run --bin period-inspect -- --file ./data/BINANCE/BTCUSDT/candles/1m/2023-11-14.bin
//!   cargo run --bin period-inspect -- --file <file.bin> --venue OKX --symbol BTC-USDT-SWAP --interval 5m

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use flowtrace_backend::models::{Interval, Venue};
use flowtrace_backend::storage::period_file;
use flowtrace_backend::storage::DecodedRecord;

#[derive(Parser, Debug)]
#[command(name = "period-inspect")]
#[command(about = "Inspect the header and records of a period file")]
struct Args {
    /// Path to the .bin period file
    #[arg(long)]
    file: PathBuf,

    /// Venue context for rebuilding reduced records
    #[arg(long, default_value = "BINANCE")]
    venue: String,

    /// Symbol context for rebuilding reduced records
    #[arg(long, default_value = "UNKNOWN")]
    symbol: String,

    /// Interval context for rebuilding reduced records
    #[arg(long, default_value = "1m")]
    interval: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let Some(venue) = Venue::from_str(&args.venue) else {
        bail!("unknown venue: {}", args.venue);
    };
    let Some(interval) = Interval::from_str(&args.interval) else {
        bail!("unknown interval: {}", args.interval);
    };

    let contents = period_file::read_period_file(&args.file, venue, &args.symbol, interval)
        .with_context(|| format!("failed to read {}", args.file.display()))?;

    match &contents.header {
        Some(h) => {
            println!("header:");
            println!("  version          {}", h.version);
            println!("  count            {}", h.count);
            println!("  first_timestamp  {}", h.first_timestamp);
            println!("  last_timestamp   {}", h.last_timestamp);
            println!("  symbol           {}", h.symbol);
            println!("  interval         {}", h.interval);
        }
        None => println!("legacy newline-delimited JSON file (no header)"),
    }

    println!("records: {}", contents.records.len());
    for (i, record) in contents.records.iter().enumerate() {
        let (kind, open_time, detail) = match record {
            DecodedRecord::Full(c) => ("FTCF", c.open_time, format!("bins={} v={}", c.bins.len(), c.volume)),
            DecodedRecord::CandleOnly(r) => ("FTCO", r.open_time, format!(
                "o={} h={} l={} c={} v={}",
                r.open, r.high, r.low, r.close, r.volume
            )),
            DecodedRecord::FootprintOnly(r) => ("FTFO", r.open_time, format!("bins={}", r.bins.len())),
            DecodedRecord::LegacyJson(c) => ("JSON", c.open_time, format!("v={}", c.volume)),
        };
        println!("  [{i:>5}] {kind} open_time={open_time} {detail}");
    }

    if let Some(h) = &contents.header {
        if h.count as usize != contents.records.len() {
            println!(
                "WARNING: header count {} != scanned records {} (stale header)",
                h.count,
                contents.records.len()
            );
        }
    }
    Ok(())
}
