//! OKX v5 public trades wire format.

use serde::Deserialize;
use serde_json::json;

use crate::models::{Trade, Venue};

pub const DEFAULT_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

/// OKX subscriptions are structured args rather than stream strings; the
/// stream name here is the instId, wrapped when the frame is built.
pub fn trade_stream(symbol: &str) -> String {
    symbol.to_uppercase()
}

pub fn subscribe_frame(streams: &[String], _id: u64) -> String {
    let args: Vec<serde_json::Value> = streams
        .iter()
        .map(|inst_id| json!({ "channel": "trades", "instId": inst_id }))
        .collect();
    json!({ "op": "subscribe", "args": args }).to_string()
}

pub fn unsubscribe_frame(streams: &[String], _id: u64) -> String {
    let args: Vec<serde_json::Value> = streams
        .iter()
        .map(|inst_id| json!({ "channel": "trades", "instId": inst_id }))
        .collect();
    json!({ "op": "unsubscribe", "args": args }).to_string()
}

#[derive(Debug, Deserialize)]
struct TradeFrame {
    arg: Arg,
    data: Vec<TradeEntry>,
}

#[derive(Debug, Deserialize)]
struct Arg {
    channel: String,
}

#[derive(Debug, Deserialize)]
struct TradeEntry {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "tradeId")]
    trade_id: String,
    #[serde(rename = "px")]
    price: String,
    #[serde(rename = "sz")]
    size: String,
    side: String,
    ts: String,
}

pub fn parse_trade_frame(text: &str) -> Vec<Trade> {
    let Ok(frame) = serde_json::from_str::<TradeFrame>(text) else {
        return Vec::new();
    };
    if frame.arg.channel != "trades" {
        return Vec::new();
    }
    frame
        .data
        .into_iter()
        .filter_map(|entry| {
            let price: f64 = entry.price.parse().ok()?;
            let quantity: f64 = entry.size.parse().ok()?;
            let ts: i64 = entry.ts.parse().ok()?;
            let trade_id = entry.trade_id.parse::<u64>().unwrap_or(ts as u64);
            Some(Trade {
                venue: Venue::Okx,
                symbol: entry.inst_id,
                trade_id,
                event_time: ts,
                trade_time: ts,
                price,
                price_raw: entry.price,
                quantity,
                is_buyer_maker: entry.side != "buy",
            })
        })
        .collect()
}
