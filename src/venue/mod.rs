//! Venue connectivity: per-venue wire codecs, the connection lifecycle, the
//! zero-gap rotation manager and REST gap recovery.
//!
//! Venue adapters are a small fixed set selected by tag; frame building and
//! decoding dispatch on `Venue` rather than an open interface.

pub mod binance;
pub mod bybit;
pub mod connector;
pub mod manager;
pub mod okx;
pub mod rest;
pub mod session;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{SymbolConfig, Trade, Venue};
pub use connector::{ConnCommand, Connection, ConnectionHandle};
pub use manager::VenueConnector;
pub use rest::{RestGapClient, RestGapConfig};
pub use session::{ConnState, SessionConfig, SessionTracker, TransitionReason};

// =============================================================================
// TAGGED DISPATCH
// =============================================================================

pub fn default_ws_url(venue: Venue) -> &'static str {
    match venue {
        Venue::Binance => binance::DEFAULT_WS_URL,
        Venue::Bybit => bybit::DEFAULT_WS_URL,
        Venue::Okx => okx::DEFAULT_WS_URL,
    }
}

pub fn trade_stream(venue: Venue, symbol: &str) -> String {
    match venue {
        Venue::Binance => binance::trade_stream(symbol),
        Venue::Bybit => bybit::trade_stream(symbol),
        Venue::Okx => okx::trade_stream(symbol),
    }
}

pub fn subscribe_frame(venue: Venue, streams: &[String], id: u64) -> String {
    match venue {
        Venue::Binance => binance::subscribe_frame(streams, id),
        Venue::Bybit => bybit::subscribe_frame(streams, id),
        Venue::Okx => okx::subscribe_frame(streams, id),
    }
}

pub fn unsubscribe_frame(venue: Venue, streams: &[String], id: u64) -> String {
    match venue {
        Venue::Binance => binance::unsubscribe_frame(streams, id),
        Venue::Bybit => bybit::unsubscribe_frame(streams, id),
        Venue::Okx => okx::unsubscribe_frame(streams, id),
    }
}

/// Decode one text frame into zero or more normalized trades.
pub fn parse_trade_frame(venue: Venue, text: &str) -> Vec<Trade> {
    match venue {
        Venue::Binance => binance::parse_trade_frame(text),
        Venue::Bybit => bybit::parse_trade_frame(text),
        Venue::Okx => okx::parse_trade_frame(text),
    }
}

/// Split streams into SUBSCRIBE batches bounded by the venue payload limit.
pub fn batch_streams(streams: &[String], batch_size: usize) -> Vec<Vec<String>> {
    streams
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

// =============================================================================
// SYMBOL CONFIG REPOSITORY
// =============================================================================

/// Read-side of the configuration store. The actual persistence lives in an
/// outer shell; the core only consumes this interface.
#[async_trait]
pub trait SymbolConfigRepository: Send + Sync {
    async fn ws_url(&self, venue: Venue) -> Result<String>;
    async fn session_config(&self, venue: Venue) -> Result<SessionConfig>;
    /// Symbols with status ACTIVE and the active flag set.
    async fn active_symbols(&self, venue: Venue) -> Result<Vec<SymbolConfig>>;
}

/// In-memory repository for tests and standalone runs.
pub struct StaticSymbolRepository {
    ws_urls: HashMap<Venue, String>,
    session: SessionConfig,
    symbols: parking_lot::RwLock<Vec<SymbolConfig>>,
}

impl StaticSymbolRepository {
    pub fn new(symbols: Vec<SymbolConfig>) -> Self {
        Self {
            ws_urls: HashMap::new(),
            session: SessionConfig::from_env(),
            symbols: parking_lot::RwLock::new(symbols),
        }
    }

    pub fn with_ws_url(mut self, venue: Venue, url: impl Into<String>) -> Self {
        self.ws_urls.insert(venue, url.into());
        self
    }

    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn push_symbol(&self, config: SymbolConfig) {
        self.symbols.write().push(config);
    }
}

#[async_trait]
impl SymbolConfigRepository for StaticSymbolRepository {
    async fn ws_url(&self, venue: Venue) -> Result<String> {
        Ok(self
            .ws_urls
            .get(&venue)
            .cloned()
            .unwrap_or_else(|| default_ws_url(venue).to_string()))
    }

    async fn session_config(&self, _venue: Venue) -> Result<SessionConfig> {
        Ok(self.session.clone())
    }

    async fn active_symbols(&self, venue: Venue) -> Result<Vec<SymbolConfig>> {
        Ok(self
            .symbols
            .read()
            .iter()
            .filter(|c| c.venue == venue && c.active && c.status == crate::models::SymbolStatus::Active)
            .cloned()
            .collect())
    }
}
