//! The sidecar process itself: single writer over the canonical state
//! database, serving the socket protocol. Runs out-of-process in production
//! (see the `flowtrace-sidecar` binary) and in-process in tests.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde_json::{json, Value};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::models::TradeGap;
use crate::sidecar::protocol::{
    self, ListGapsPayload, LoadStatesPayload, Request, Response, WriteDirtyPayload, MSG_FLUSH_ALL,
    MSG_LIST_GAPS, MSG_LOAD_STATES, MSG_WRITE_DIRTY,
};

// =============================================================================
// STORAGE SCHEMA
// =============================================================================

const STATE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

-- Deduplication floor per symbol
CREATE TABLE IF NOT EXISTS symbol_states (
    symbol TEXT PRIMARY KEY,
    last_trade_id INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

-- Open-candle snapshots, one per (symbol, interval)
CREATE TABLE IF NOT EXISTS candle_snapshots (
    symbol TEXT NOT NULL,
    interval TEXT NOT NULL,
    open_time INTEGER NOT NULL,
    payload TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (symbol, interval)
) WITHOUT ROWID;

-- Observed trade-id gaps awaiting recovery
CREATE TABLE IF NOT EXISTS trade_gaps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    start_id INTEGER NOT NULL,
    end_id INTEGER NOT NULL,
    detected_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trade_gaps_symbol
    ON trade_gaps(symbol, start_id);
"#;

// =============================================================================
// SERVER
// =============================================================================

pub struct SidecarServer {
    conn: Arc<Mutex<Connection>>,
}

impl SidecarServer {
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open state db {}", db_path))?;
        conn.execute_batch(STATE_SCHEMA)?;
        info!(path = %db_path, "state db opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(STATE_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bind the socket and serve until the task is aborted. A stale socket
    /// file from a previous run is removed first.
    pub async fn serve(self: Arc<Self>, socket_path: &str) -> Result<()> {
        let _ = std::fs::remove_file(socket_path);
        if let Some(parent) = Path::new(socket_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind sidecar socket {}", socket_path))?;
        info!(path = %socket_path, "sidecar listening");

        loop {
            let (stream, _addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    debug!(error = %e, "sidecar connection closed");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        loop {
            let request: Request = protocol::read_frame(&mut stream).await?;
            let response = self.dispatch(request);
            protocol::write_frame(&mut stream, &response).await?;
        }
    }

    fn dispatch(&self, request: Request) -> Response {
        let Request { id, kind, data } = request;
        let result = match kind.as_str() {
            MSG_LOAD_STATES => self.handle_load_states(data),
            MSG_WRITE_DIRTY => self.handle_write_dirty(data),
            MSG_FLUSH_ALL => self.handle_flush_all(),
            MSG_LIST_GAPS => self.handle_list_gaps(data),
            other => Err(anyhow::anyhow!("unknown message type: {}", other)),
        };
        match result {
            Ok(value) => Response::ok(id, value),
            Err(e) => {
                warn!(id, error = %e, "sidecar request failed");
                Response::err(id, format!("{e:#}"))
            }
        }
    }

    fn handle_load_states(&self, data: Value) -> Result<Value> {
        let payload: LoadStatesPayload = serde_json::from_value(data)?;
        let conn = self.conn.lock();
        let mut states = std::collections::HashMap::new();
        let mut stmt = conn.prepare("SELECT last_trade_id FROM symbol_states WHERE symbol = ?1")?;
        for symbol in &payload.symbols {
            let last: Option<i64> = stmt
                .query_row(params![symbol], |row| row.get(0))
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            if let Some(last) = last {
                states.insert(symbol.clone(), last as u64);
            }
        }
        Ok(json!({ "states": states }))
    }

    fn handle_write_dirty(&self, data: Value) -> Result<Value> {
        let payload: WriteDirtyPayload = serde_json::from_value(data)?;
        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for entry in &payload.entries {
            tx.execute(
                "INSERT INTO symbol_states (symbol, last_trade_id, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(symbol) DO UPDATE SET
                     last_trade_id = MAX(last_trade_id, excluded.last_trade_id),
                     updated_at = excluded.updated_at",
                params![entry.symbol, entry.last_trade_id as i64, now],
            )?;
            for candle in &entry.candles {
                tx.execute(
                    "INSERT INTO candle_snapshots (symbol, interval, open_time, payload, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(symbol, interval) DO UPDATE SET
                         open_time = excluded.open_time,
                         payload = excluded.payload,
                         updated_at = excluded.updated_at",
                    params![
                        entry.symbol,
                        candle.interval.as_str(),
                        candle.open_time,
                        serde_json::to_string(candle)?,
                        now
                    ],
                )?;
            }
            for gap in &entry.gaps {
                tx.execute(
                    "INSERT INTO trade_gaps (symbol, start_id, end_id, detected_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![entry.symbol, gap.start_id as i64, gap.end_id as i64, now],
                )?;
            }
        }
        let written = payload.entries.len();
        tx.commit()?;
        Ok(json!({ "written": written }))
    }

    fn handle_flush_all(&self) -> Result<Value> {
        let conn = self.conn.lock();
        // WAL checkpoint makes everything durable on the main db file.
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        Ok(json!({ "flushed": true }))
    }

    fn handle_list_gaps(&self, data: Value) -> Result<Value> {
        let payload: ListGapsPayload = serde_json::from_value(data)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT start_id, end_id FROM trade_gaps
             WHERE symbol = ?1 AND start_id >= ?2
             ORDER BY start_id",
        )?;
        let gaps: Vec<TradeGap> = stmt
            .query_map(params![payload.symbol, payload.since as i64], |row| {
                Ok(TradeGap {
                    start_id: row.get::<_, i64>(0)? as u64,
                    end_id: row.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(json!({ "gaps": gaps }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FootprintCandle, Interval, Venue};
    use crate::sidecar::client::SidecarClient;
    use crate::sidecar::protocol::DirtyEntry;

    async fn start_server(dir: &Path) -> (String, tokio::task::JoinHandle<()>) {
        let socket = dir.join("sidecar.sock").to_string_lossy().into_owned();
        let server = Arc::new(SidecarServer::open_in_memory().unwrap());
        let path = socket.clone();
        let handle = tokio::spawn(async move {
            let _ = server.serve(&path).await;
        });
        // Wait for the socket file to appear.
        for _ in 0..100 {
            if Path::new(&socket).exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        (socket, handle)
    }

    #[tokio::test]
    async fn state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, server) = start_server(dir.path()).await;
        let client = SidecarClient::new(&socket);

        // Unknown symbols are absent.
        let states = client
            .load_states_for_symbols(&["BTCUSDT".to_string()])
            .await
            .unwrap();
        assert!(states.is_empty());

        let mut candle = FootprintCandle::new(Venue::Binance, "BTCUSDT", Interval::M1, 1_700_000_040_000);
        candle.close = 101.0;
        client
            .write_dirty(vec![DirtyEntry {
                symbol: "BTCUSDT".to_string(),
                last_trade_id: 42,
                candles: vec![candle],
                gaps: vec![TradeGap { start_id: 10, end_id: 13 }],
            }])
            .await
            .unwrap();

        let states = client
            .load_states_for_symbols(&["BTCUSDT".to_string(), "ETHUSDT".to_string()])
            .await
            .unwrap();
        assert_eq!(states.get("BTCUSDT"), Some(&42));
        assert!(!states.contains_key("ETHUSDT"));

        let gaps = client.list_gaps("BTCUSDT", 0).await.unwrap();
        assert_eq!(gaps, vec![TradeGap { start_id: 10, end_id: 13 }]);
        let gaps = client.list_gaps("BTCUSDT", 11).await.unwrap();
        assert!(gaps.is_empty());

        client.flush_all().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn floor_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, server) = start_server(dir.path()).await;
        let client = SidecarClient::new(&socket);

        for floor in [100u64, 50, 120] {
            client
                .write_dirty(vec![DirtyEntry {
                    symbol: "ETHUSDT".to_string(),
                    last_trade_id: floor,
                    candles: vec![],
                    gaps: vec![],
                }])
                .await
                .unwrap();
        }
        // A stale lower floor must never regress the stored one.
        let states = client
            .load_states_for_symbols(&["ETHUSDT".to_string()])
            .await
            .unwrap();
        assert_eq!(states.get("ETHUSDT"), Some(&120));
        server.abort();
    }

    #[tokio::test]
    async fn unavailable_socket_is_typed() {
        let client = SidecarClient::new("/nonexistent/path/sidecar.sock");
        let err = client
            .load_states_for_symbols(&["BTCUSDT".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::errors::IngestError::SidecarUnavailable(_)));
    }
}
