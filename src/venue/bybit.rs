//! Bybit v5 linear perpetual wire format.

use serde::Deserialize;
use serde_json::json;

use crate::models::{Trade, Venue};

pub const DEFAULT_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";

pub fn trade_stream(symbol: &str) -> String {
    format!("publicTrade.{}", symbol.to_uppercase())
}

pub fn subscribe_frame(streams: &[String], id: u64) -> String {
    json!({ "op": "subscribe", "args": streams, "req_id": id.to_string() }).to_string()
}

pub fn unsubscribe_frame(streams: &[String], id: u64) -> String {
    json!({ "op": "unsubscribe", "args": streams, "req_id": id.to_string() }).to_string()
}

#[derive(Debug, Deserialize)]
struct TradeFrame {
    topic: String,
    data: Vec<TradeEntry>,
}

#[derive(Debug, Deserialize)]
struct TradeEntry {
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    quantity: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "i")]
    trade_id: String,
}

/// Decode one text frame; a frame may carry several trades.
pub fn parse_trade_frame(text: &str) -> Vec<Trade> {
    let Ok(frame) = serde_json::from_str::<TradeFrame>(text) else {
        return Vec::new();
    };
    if !frame.topic.starts_with("publicTrade.") {
        return Vec::new();
    }
    frame
        .data
        .into_iter()
        .filter_map(|entry| {
            let price: f64 = entry.price.parse().ok()?;
            let quantity: f64 = entry.quantity.parse().ok()?;
            // Bybit ids are opaque strings on some markets; fall back to the
            // trade timestamp when they are not numeric.
            let trade_id = entry
                .trade_id
                .parse::<u64>()
                .unwrap_or(entry.trade_time as u64);
            Some(Trade {
                venue: Venue::Bybit,
                symbol: entry.symbol,
                trade_id,
                event_time: entry.trade_time,
                trade_time: entry.trade_time,
                price,
                price_raw: entry.price,
                quantity,
                // "Buy" means the aggressor bought, i.e. the buyer was taker.
                is_buyer_maker: entry.side != "Buy",
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trade_batch() {
        let frame = r#"{"topic":"publicTrade.BTCUSDT","type":"snapshot","ts":1700000000200,"data":[
            {"T":1700000000100,"s":"BTCUSDT","S":"Buy","v":"0.5","p":"50000.1","i":"101","BT":false},
            {"T":1700000000150,"s":"BTCUSDT","S":"Sell","v":"1.0","p":"50000.0","i":"102","BT":false}
        ]}"#;
        let trades = parse_trade_frame(frame);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].trade_id, 101);
        assert!(!trades[0].is_buyer_maker);
        assert!(trades[1].is_buyer_maker);
        assert_eq!(trades[1].venue, Venue::Bybit);
    }

    #[test]
    fn non_numeric_id_falls_back_to_timestamp() {
        let frame = r#"{"topic":"publicTrade.BTCUSDT","data":[
            {"T":1700000000100,"s":"BTCUSDT","S":"Buy","v":"1","p":"2","i":"8a5c-uuid"}
        ]}"#;
        let trades = parse_trade_frame(frame);
        assert_eq!(trades[0].trade_id, 1_700_000_000_100);
    }

    #[test]
    fn ignores_other_topics() {
        let frame = r#"{"topic":"orderbook.50.BTCUSDT","data":[]}"#;
        assert!(parse_trade_frame(frame).is_empty());
        assert!(parse_trade_frame(r#"{"success":true,"op":"subscribe"}"#).is_empty());
    }

    #[test]
    fn subscribe_frame_shape() {
        let frame = subscribe_frame(&[trade_stream("btcusdt")], 9);
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["op"], "subscribe");
        assert_eq!(v["args"][0], "publicTrade.BTCUSDT");
    }
}
