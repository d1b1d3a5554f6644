//! Binance USDⓈ-M futures wire format: stream names, SUBSCRIBE frames and
//! aggTrade event decoding.

use serde::Deserialize;
use serde_json::json;

use crate::models::{Trade, Venue};

pub const DEFAULT_WS_URL: &str = "wss://fstream.binance.com/ws";
pub const DEFAULT_REST_URL: &str = "https://fapi.binance.com";

pub fn trade_stream(symbol: &str) -> String {
    format!("{}@aggTrade", symbol.to_lowercase())
}

pub fn subscribe_frame(streams: &[String], id: u64) -> String {
    json!({ "method": "SUBSCRIBE", "params": streams, "id": id }).to_string()
}

pub fn unsubscribe_frame(streams: &[String], id: u64) -> String {
    json!({ "method": "UNSUBSCRIBE", "params": streams, "id": id }).to_string()
}

/// aggTrade event payload. Combined-stream frames nest it under `data`.
#[derive(Debug, Deserialize)]
struct AggTradeEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "a")]
    agg_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

#[derive(Debug, Deserialize)]
struct CombinedFrame {
    data: AggTradeEvent,
}

/// Decode one text frame. Non-trade frames (subscribe ACKs, other events)
/// return an empty vec.
pub fn parse_trade_frame(text: &str) -> Vec<Trade> {
    let event = match serde_json::from_str::<AggTradeEvent>(text) {
        Ok(event) => event,
        Err(_) => match serde_json::from_str::<CombinedFrame>(text) {
            Ok(combined) => combined.data,
            Err(_) => return Vec::new(),
        },
    };
    if event.event_type != "aggTrade" {
        return Vec::new();
    }
    let Ok(price) = event.price.parse::<f64>() else {
        return Vec::new();
    };
    let Ok(quantity) = event.quantity.parse::<f64>() else {
        return Vec::new();
    };
    vec![Trade {
        venue: Venue::Binance,
        symbol: event.symbol,
        trade_id: event.agg_id,
        event_time: event.event_time,
        trade_time: event.trade_time,
        price,
        price_raw: event.price,
        quantity,
        is_buyer_maker: event.is_buyer_maker,
    }]
}
