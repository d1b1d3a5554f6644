//! Client side of the persistence sidecar.
//!
//! One connection per client, reconnected on demand. Calls are serialized;
//! a timed-out correlation id is abandoned together with the connection so a
//! late response can never be matched to the wrong call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::errors::IngestError;
use crate::models::TradeGap;
use crate::sidecar::protocol::{
    self, DirtyEntry, ListGapsPayload, ListGapsResult, LoadStatesPayload, LoadStatesResult,
    Request, Response, MSG_FLUSH_ALL, MSG_LIST_GAPS, MSG_LOAD_STATES, MSG_WRITE_DIRTY,
};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct SidecarClientStats {
    pub requests: AtomicU64,
    pub timeouts: AtomicU64,
    pub io_failures: AtomicU64,
    pub reconnects: AtomicU64,
}

impl SidecarClientStats {
    pub fn summary(&self) -> String {
        format!(
            "requests={} timeouts={} io_failures={} reconnects={}",
            self.requests.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
            self.io_failures.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
        )
    }
}

/// StateStore + GapReader over the sidecar socket.
pub struct SidecarClient {
    socket_path: String,
    timeout: Duration,
    next_id: AtomicU64,
    conn: tokio::sync::Mutex<Option<UnixStream>>,
    pub stats: SidecarClientStats,
}

impl SidecarClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_RPC_TIMEOUT,
            next_id: AtomicU64::new(1),
            conn: tokio::sync::Mutex::new(None),
            stats: SidecarClientStats::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self, kind: &str, data: Value) -> Result<Value, IngestError> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            id,
            kind: kind.to_string(),
            data,
        };

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
                self.stats.io_failures.fetch_add(1, Ordering::Relaxed);
                IngestError::SidecarUnavailable(format!("connect {}: {}", self.socket_path, e))
            })?;
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            debug!(path = %self.socket_path, "sidecar_connected");
            *guard = Some(stream);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(IngestError::SidecarUnavailable("connection unavailable".to_string()));
        };

        let exchange = async {
            protocol::write_frame(stream, &request).await?;
            loop {
                let response: Response = protocol::read_frame(stream).await?;
                if response.id == id {
                    return anyhow::Ok(response);
                }
                // Stale reply from an abandoned correlation id on a previous
                // connection generation; skip it.
                debug!(got = response.id, want = id, "skipping stale sidecar response");
            }
        };

        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.stats.io_failures.fetch_add(1, Ordering::Relaxed);
                *guard = None;
                return Err(IngestError::SidecarUnavailable(format!("{e:#}")));
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                // Abandon the correlation id: the connection is dropped so a
                // late reply cannot be misattributed.
                *guard = None;
                warn!(kind, id, timeout_ms = self.timeout.as_millis() as u64, "sidecar_rpc_timeout");
                return Err(IngestError::timeout(
                    format!("sidecar {kind}"),
                    self.timeout.as_millis() as u64,
                ));
            }
        };

        if response.success {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            Err(IngestError::SidecarUnavailable(
                response.error.unwrap_or_else(|| "unknown sidecar error".to_string()),
            ))
        }
    }

    // -------------------------------------------------------------------------
    // StateStore
    // -------------------------------------------------------------------------

    /// Last persisted trade id per symbol. Symbols never seen come back
    /// absent; callers treat that as floor 0.
    pub async fn load_states_for_symbols(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, u64>, IngestError> {
        let data = serde_json::to_value(LoadStatesPayload {
            symbols: symbols.to_vec(),
        })
        .map_err(|e| IngestError::SidecarUnavailable(e.to_string()))?;
        let result = self.request(MSG_LOAD_STATES, data).await?;
        let parsed: LoadStatesResult = serde_json::from_value(result)
            .map_err(|e| IngestError::SidecarUnavailable(format!("bad LOAD_STATES result: {e}")))?;
        Ok(parsed.states)
    }

    /// Persist a batch of dirty symbol states.
    pub async fn write_dirty(&self, entries: Vec<DirtyEntry>) -> Result<(), IngestError> {
        if entries.is_empty() {
            return Ok(());
        }
        let data = serde_json::to_value(protocol::WriteDirtyPayload { entries })
            .map_err(|e| IngestError::SidecarUnavailable(e.to_string()))?;
        self.request(MSG_WRITE_DIRTY, data).await.map(|_| ())
    }

    /// Ask the sidecar to make everything durable.
    pub async fn flush_all(&self) -> Result<(), IngestError> {
        self.request(MSG_FLUSH_ALL, Value::Null).await.map(|_| ())
    }

    // -------------------------------------------------------------------------
    // GapReader
    // -------------------------------------------------------------------------

    pub async fn list_gaps(&self, symbol: &str, since: u64) -> Result<Vec<TradeGap>, IngestError> {
        let data = serde_json::to_value(ListGapsPayload {
            symbol: symbol.to_string(),
            since,
        })
        .map_err(|e| IngestError::SidecarUnavailable(e.to_string()))?;
        let result = self.request(MSG_LIST_GAPS, data).await?;
        let parsed: ListGapsResult = serde_json::from_value(result)
            .map_err(|e| IngestError::SidecarUnavailable(format!("bad LIST_GAPS result: {e}")))?;
        Ok(parsed.gaps)
    }
}
