//! Sidecar wire protocol.
//!
//! Length-delimited request/response over a Unix-domain stream socket:
//! a 4-byte big-endian length prefix, then a self-describing JSON payload.
//! Requests carry `{id, type, data}`; responses `{id, success, result|error}`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::models::{FootprintCandle, TradeGap};

/// Upper bound on a single frame; a dirty batch of large candles stays well
/// under this.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

// =============================================================================
// MESSAGE TYPES
// =============================================================================

pub const MSG_LOAD_STATES: &str = "LOAD_STATES";
pub const MSG_WRITE_DIRTY: &str = "WRITE_DIRTY";
pub const MSG_FLUSH_ALL: &str = "FLUSH_ALL";
pub const MSG_LIST_GAPS: &str = "LIST_GAPS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

// =============================================================================
// TYPED PAYLOADS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadStatesPayload {
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadStatesResult {
    /// symbol -> last persisted trade id.
    pub states: std::collections::HashMap<String, u64>,
}

/// One symbol's dirty state: the deduplication floor, open-candle snapshots
/// and any gaps observed since the previous flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtyEntry {
    pub symbol: String,
    pub last_trade_id: u64,
    #[serde(default)]
    pub candles: Vec<FootprintCandle>,
    #[serde(default)]
    pub gaps: Vec<TradeGap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteDirtyPayload {
    pub entries: Vec<DirtyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListGapsPayload {
    pub symbol: String,
    /// Only gaps whose start id is at or above this floor.
    pub since: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListGapsResult {
    pub gaps: Vec<TradeGap>,
}

// =============================================================================
// FRAMING
// =============================================================================

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).context("sidecar frame encode failed")?;
    if body.len() > MAX_FRAME_BYTES {
        bail!("sidecar frame too large: {} bytes", body.len());
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        bail!("sidecar frame too large: {} bytes", len);
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).context("sidecar frame decode failed")
}
