//! A single venue WebSocket connection: dial, batched subscribe, read loop,
//! heartbeat, and command-driven resubscription.
//!
//! The connection pushes normalized trades into a bounded channel; when the
//! consumer falls behind the send blocks, which stops the read loop and lets
//! TCP back-pressure reach the venue. No silent drops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::{Trade, Venue};
use crate::venue::session::{
    ConnState, HeartbeatAction, HeartbeatMonitor, SessionConfig, SessionTracker, TransitionReason,
};

/// Commands the owner can send into a live connection.
#[derive(Debug)]
pub enum ConnCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    /// Drain and close (rotation retirement or shutdown).
    Close,
}

/// Why the connection task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnExit {
    CleanClose,
    ServerClose,
    NetworkError,
    ConnectTimeout,
    ConnectFailed,
    PongTimeout,
    DataStale,
    /// The trade channel was dropped; the process is going down.
    SinkClosed,
}

pub struct ConnectionHandle {
    pub cmd_tx: mpsc::Sender<ConnCommand>,
    pub join: JoinHandle<ConnExit>,
    pub opened_at: Instant,
    /// Trades pushed downstream by this connection.
    pub produced: Arc<AtomicU64>,
    /// Set once the WebSocket handshake completed.
    pub connected: Arc<AtomicBool>,
}

pub struct Connection;

impl Connection {
    /// Dial and run a connection in a background task. Subscribes to
    /// `streams` in batches right after the handshake.
    pub fn open(
        venue: Venue,
        ws_url: String,
        streams: Vec<String>,
        config: SessionConfig,
        tracker: Arc<SessionTracker>,
        sink: mpsc::Sender<Trade>,
    ) -> ConnectionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let produced = Arc::new(AtomicU64::new(0));
        let connected = Arc::new(AtomicBool::new(false));

        let task_produced = Arc::clone(&produced);
        let task_connected = Arc::clone(&connected);
        let join = tokio::spawn(async move {
            run_connection(
                venue,
                ws_url,
                streams,
                config,
                tracker,
                sink,
                cmd_rx,
                task_produced,
                task_connected,
            )
            .await
        });

        ConnectionHandle {
            cmd_tx,
            join,
            opened_at: Instant::now(),
            produced,
            connected,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    venue: Venue,
    ws_url: String,
    streams: Vec<String>,
    config: SessionConfig,
    tracker: Arc<SessionTracker>,
    sink: mpsc::Sender<Trade>,
    mut cmd_rx: mpsc::Receiver<ConnCommand>,
    produced: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
) -> ConnExit {
    debug!(venue = %venue, url = %ws_url, streams = streams.len(), "connecting");

    let connect = tokio::time::timeout(config.connect_timeout(), connect_async(&ws_url)).await;
    let ws = match connect {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            warn!(venue = %venue, error = %e, "connect_failed");
            return ConnExit::ConnectFailed;
        }
        Err(_) => {
            warn!(venue = %venue, timeout_ms = config.connect_timeout_ms, "connect_timeout");
            return ConnExit::ConnectTimeout;
        }
    };
    connected.store(true, Ordering::SeqCst);
    tracker.transition(ConnState::Connected, TransitionReason::ConnectSuccess);

    let (mut write, mut read) = ws.split();
    let mut subscribe_id: u64 = 1;

    // Batched SUBSCRIBE for the full stream set, bounded by the venue's
    // payload limit.
    for batch in crate::venue::batch_streams(&streams, config.subscribe_batch_size) {
        let frame = crate::venue::subscribe_frame(venue, &batch, subscribe_id);
        subscribe_id += 1;
        if write.send(Message::Text(frame)).await.is_err() {
            return ConnExit::NetworkError;
        }
        tokio::time::sleep(Duration::from_millis(config.subscribe_batch_pause_ms)).await;
    }
    info!(venue = %venue, streams = streams.len(), "subscribed");

    let mut heartbeat = HeartbeatMonitor::new(&config);
    heartbeat.reset();
    let mut heartbeat_tick = tokio::time::interval(Duration::from_millis(500));
    heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        tracker.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
                        heartbeat.record_frame_received();
                        let trades = crate::venue::parse_trade_frame(venue, &text);
                        for trade in trades {
                            tracker.metrics.trades_decoded.fetch_add(1, Ordering::Relaxed);
                            produced.fetch_add(1, Ordering::Relaxed);
                            if sink.send(trade).await.is_err() {
                                return ConnExit::SinkClosed;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        heartbeat.record_frame_received();
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        heartbeat.record_frame_received();
                        heartbeat.record_pong_received();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(venue = %venue, ?frame, "server_close");
                        return ConnExit::ServerClose;
                    }
                    Some(Ok(_)) => {
                        heartbeat.record_frame_received();
                    }
                    Some(Err(e)) => {
                        warn!(venue = %venue, error = %e, "ws_error");
                        return ConnExit::NetworkError;
                    }
                    None => {
                        warn!(venue = %venue, "stream_ended");
                        return ConnExit::ServerClose;
                    }
                }
            }

            command = cmd_rx.recv() => {
                match command {
                    Some(ConnCommand::Subscribe(new_streams)) => {
                        for batch in crate::venue::batch_streams(&new_streams, config.subscribe_batch_size) {
                            let frame = crate::venue::subscribe_frame(venue, &batch, subscribe_id);
                            subscribe_id += 1;
                            if write.send(Message::Text(frame)).await.is_err() {
                                return ConnExit::NetworkError;
                            }
                            tokio::time::sleep(Duration::from_millis(config.subscribe_batch_pause_ms)).await;
                        }
                    }
                    Some(ConnCommand::Unsubscribe(old_streams)) => {
                        for batch in crate::venue::batch_streams(&old_streams, config.subscribe_batch_size) {
                            let frame = crate::venue::unsubscribe_frame(venue, &batch, subscribe_id);
                            subscribe_id += 1;
                            let _ = write.send(Message::Text(frame)).await;
                        }
                    }
                    Some(ConnCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return ConnExit::CleanClose;
                    }
                }
            }

            _ = heartbeat_tick.tick() => {
                match heartbeat.check() {
                    HeartbeatAction::Ok => {}
                    HeartbeatAction::SendPing => {
                        if write.send(Message::Ping(Vec::new())).await.is_ok() {
                            heartbeat.record_ping_sent();
                        }
                    }
                    HeartbeatAction::PongTimeout => {
                        warn!(venue = %venue, "pong_timeout");
                        return ConnExit::PongTimeout;
                    }
                    HeartbeatAction::DataStale => {
                        warn!(venue = %venue, "data_stale");
                        return ConnExit::DataStale;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal in-process WebSocket venue: accepts one connection, captures
    /// subscribe frames, then plays the given frames and closes.
    async fn spawn_fake_venue(
        frames: Vec<String>,
    ) -> (String, tokio::sync::oneshot::Receiver<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (subs_tx, subs_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            // First frame is the SUBSCRIBE.
            let mut subs = Vec::new();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                subs.push(text);
            }
            let _ = subs_tx.send(subs);

            for frame in frames {
                let _ = ws.send(Message::Text(frame)).await;
            }
            let _ = ws.close(None).await;
        });

        (format!("ws://{}", addr), subs_rx)
    }

    #[tokio::test]
    async fn connects_subscribes_and_normalizes() {
        let trade_frame = r#"{"e":"aggTrade","E":2,"s":"BTCUSDT","a":42,"p":"50000.1","q":"0.5","T":1,"m":false}"#;
        let (url, subs_rx) = spawn_fake_venue(vec![trade_frame.to_string()]).await;

        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let tracker = Arc::new(SessionTracker::new());
        let mut config = SessionConfig::default();
        config.subscribe_batch_pause_ms = 1;

        let handle = Connection::open(
            Venue::Binance,
            url,
            vec!["btcusdt@aggTrade".to_string()],
            config,
            Arc::clone(&tracker),
            sink_tx,
        );

        let trade = tokio::time::timeout(Duration::from_secs(5), sink_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trade.trade_id, 42);
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(handle.produced.load(Ordering::Relaxed), 1);
        assert!(handle.connected.load(Ordering::SeqCst));

        let subs = subs_rx.await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&subs[0]).unwrap();
        assert_eq!(v["method"], "SUBSCRIBE");
        assert_eq!(v["params"][0], "btcusdt@aggTrade");

        // Server closed after playing its frames.
        let exit = handle.join.await.unwrap();
        assert_eq!(exit, ConnExit::ServerClose);
    }

    #[tokio::test]
    async fn close_command_exits_cleanly() {
        // A venue that stays silent until the client closes.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        });

        let (sink_tx, _sink_rx) = mpsc::channel(16);
        let tracker = Arc::new(SessionTracker::new());
        let mut config = SessionConfig::default();
        config.subscribe_batch_pause_ms = 1;

        let handle = Connection::open(
            Venue::Binance,
            format!("ws://{}", addr),
            vec![],
            config,
            tracker,
            sink_tx,
        );
        // Give the handshake a moment.
        for _ in 0..100 {
            if handle.connected.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.cmd_tx.send(ConnCommand::Close).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.join)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ConnExit::CleanClose);
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails() {
        let (sink_tx, _sink_rx) = mpsc::channel(1);
        let tracker = Arc::new(SessionTracker::new());
        let mut config = SessionConfig::default();
        config.connect_timeout_ms = 500;

        let handle = Connection::open(
            Venue::Okx,
            "ws://127.0.0.1:1".to_string(),
            vec![],
            config,
            tracker,
            sink_tx,
        );
        let exit = handle.join.await.unwrap();
        assert!(matches!(exit, ConnExit::ConnectFailed | ConnExit::ConnectTimeout));
    }
}
