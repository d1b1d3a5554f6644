//! REST gap recovery.
//!
//! Fetches the aggregate trades missed inside a detected id gap. Requests
//! are spaced at least 100 ms apart; HTTP 429 aborts the current batch and
//! counts against the rate-limit metric so callers back off.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::IngestError;
use crate::models::{Trade, Venue};

#[derive(Debug, Clone)]
pub struct RestGapConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Minimum spacing between requests.
    pub min_spacing: Duration,
    /// Trades per page; the venue caps this at 1000.
    pub page_limit: u32,
}

impl Default for RestGapConfig {
    fn default() -> Self {
        Self {
            base_url: crate::venue::binance::DEFAULT_REST_URL.to_string(),
            timeout: Duration::from_secs(10),
            min_spacing: Duration::from_millis(100),
            page_limit: 1_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct RestGapStats {
    pub requests: AtomicU64,
    pub trades_recovered: AtomicU64,
    pub rate_limited: AtomicU64,
    pub errors: AtomicU64,
}

impl RestGapStats {
    pub fn summary(&self) -> String {
        format!(
            "requests={} recovered={} rate_limited={} errors={}",
            self.requests.load(Ordering::Relaxed),
            self.trades_recovered.load(Ordering::Relaxed),
            self.rate_limited.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

/// Binance aggTrades row.
#[derive(Debug, Deserialize)]
struct AggTradeRow {
    a: u64,
    p: String,
    q: String,
    #[serde(rename = "T")]
    t: i64,
    m: bool,
}

pub struct RestGapClient {
    venue: Venue,
    client: reqwest::Client,
    config: RestGapConfig,
    last_request: tokio::sync::Mutex<Option<Instant>>,
    pub stats: RestGapStats,
}

impl RestGapClient {
    pub fn new(venue: Venue, config: RestGapConfig) -> anyhow::Result<Self> {
        use anyhow::Context;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(4)
            .build()
            .context("failed to build gap recovery client")?;
        Ok(Self {
            venue,
            client,
            config,
            last_request: tokio::sync::Mutex::new(None),
            stats: RestGapStats::default(),
        })
    }

    /// Simple token spacing: at most one request per `min_spacing`.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.config.min_spacing {
                tokio::time::sleep(self.config.min_spacing - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Recover the trades strictly inside `(start_id, end_id)`, ascending.
    /// Gap recovery is only available where the venue offers an id-addressed
    /// trade lookup; other venues return empty.
    pub async fn sync_missing_trades(
        &self,
        symbol: &str,
        start_id: u64,
        end_id: u64,
    ) -> Result<Vec<Trade>, IngestError> {
        if self.venue != Venue::Binance {
            debug!(venue = %self.venue, "no REST gap recovery for venue");
            return Ok(Vec::new());
        }
        if end_id <= start_id + 1 {
            return Ok(Vec::new());
        }

        let mut recovered: Vec<Trade> = Vec::new();
        let mut from_id = start_id + 1;

        while from_id < end_id {
            self.pace().await;
            let remaining = end_id - from_id;
            let limit = remaining.min(self.config.page_limit as u64);
            let url = format!(
                "{}/fapi/v1/aggTrades?symbol={}&fromId={}&limit={}",
                self.config.base_url, symbol, from_id, limit
            );
            self.stats.requests.fetch_add(1, Ordering::Relaxed);

            let response = self.client.get(&url).send().await.map_err(|e| {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                if e.is_timeout() {
                    IngestError::timeout(format!("aggTrades {symbol}"), self.config.timeout.as_millis() as u64)
                } else {
                    IngestError::VenueTransient(format!("aggTrades {symbol}: {e}"))
                }
            })?;

            let status = response.status();
            if status.as_u16() == 429 {
                self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                let used_weight = response
                    .headers()
                    .get("x-mbx-used-weight-1m")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("?")
                    .to_string();
                warn!(symbol, used_weight = %used_weight, "gap recovery rate limited; aborting batch");
                return Err(IngestError::VenueTransient(format!(
                    "429 rate limited (used weight {used_weight})"
                )));
            }
            if !status.is_success() {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                let body = response.text().await.unwrap_or_default();
                return Err(IngestError::VenueTransient(format!(
                    "aggTrades {symbol} {status}: {body}"
                )));
            }

            let rows: Vec<AggTradeRow> = response.json().await.map_err(|e| {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                IngestError::VenueTransient(format!("aggTrades parse: {e}"))
            })?;
            if rows.is_empty() {
                break;
            }

            let mut max_id = from_id;
            for row in rows {
                max_id = max_id.max(row.a);
                if row.a <= start_id || row.a >= end_id {
                    continue;
                }
                let Ok(price) = row.p.parse::<f64>() else { continue };
                let Ok(quantity) = row.q.parse::<f64>() else { continue };
                recovered.push(Trade {
                    venue: self.venue,
                    symbol: symbol.to_string(),
                    trade_id: row.a,
                    event_time: row.t,
                    trade_time: row.t,
                    price,
                    price_raw: row.p,
                    quantity,
                    is_buyer_maker: row.m,
                });
            }

            if max_id + 1 <= from_id {
                break; // No forward progress; stop rather than spin.
            }
            from_id = max_id + 1;
        }

        recovered.sort_by_key(|t| t.trade_id);
        self.stats
            .trades_recovered
            .fetch_add(recovered.len() as u64, Ordering::Relaxed);
        debug!(symbol, start_id, end_id, count = recovered.len(), "gap_recovered");
        Ok(recovered)
    }
}
