//! Venue connection manager: reconnect with backoff, full resubscription on
//! every CONNECTED transition, and zero-gap rotation for venues that enforce
//! a hard connection lifetime.
//!
//! Rotation overlaps two connections: a secondary opens before the deadline,
//! subscribes to the same streams, and only once it is producing trades does
//! the primary drain and close. Trade-id deduplication downstream removes
//! the overlap.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::models::{Trade, Venue};
use crate::venue::connector::{ConnCommand, ConnExit, Connection, ConnectionHandle};
use crate::venue::session::{BackoffCalculator, ConnState, SessionConfig, SessionTracker, TransitionReason};

enum MonitorEvent {
    Exited(ConnExit),
    RotationDue,
}

pub struct VenueConnector {
    venue: Venue,
    ws_url: String,
    config: SessionConfig,
    sink: mpsc::Sender<Trade>,
    tracker: Arc<SessionTracker>,
    /// Active stream set; resubscribed in full on every connect.
    streams: RwLock<BTreeSet<String>>,
    /// Command lane into the live primary connection.
    current_cmd: RwLock<Option<mpsc::Sender<ConnCommand>>>,
    shutdown: AtomicBool,
}

impl VenueConnector {
    pub fn new(
        venue: Venue,
        ws_url: impl Into<String>,
        config: SessionConfig,
        sink: mpsc::Sender<Trade>,
    ) -> Arc<Self> {
        Arc::new(Self {
            venue,
            ws_url: ws_url.into(),
            config,
            sink,
            tracker: Arc::new(SessionTracker::new()),
            streams: RwLock::new(BTreeSet::new()),
            current_cmd: RwLock::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Add streams for the given symbols; live connections subscribe
    /// immediately, and every future connect includes them.
    pub async fn subscribe_symbols(&self, symbols: &[String]) {
        let mut fresh = Vec::new();
        {
            let mut streams = self.streams.write();
            for symbol in symbols {
                let stream = crate::venue::trade_stream(self.venue, symbol);
                if streams.insert(stream.clone()) {
                    fresh.push(stream);
                }
            }
        }
        if fresh.is_empty() {
            return;
        }
        let cmd = self.current_cmd.read().clone();
        if let Some(cmd) = cmd {
            let _ = cmd.send(ConnCommand::Subscribe(fresh)).await;
        }
    }

    pub async fn unsubscribe_symbols(&self, symbols: &[String]) {
        let mut removed = Vec::new();
        {
            let mut streams = self.streams.write();
            for symbol in symbols {
                let stream = crate::venue::trade_stream(self.venue, symbol);
                if streams.remove(&stream) {
                    removed.push(stream);
                }
            }
        }
        if removed.is_empty() {
            return;
        }
        let cmd = self.current_cmd.read().clone();
        if let Some(cmd) = cmd {
            let _ = cmd.send(ConnCommand::Unsubscribe(removed)).await;
        }
    }

    /// Spawn the connection lifecycle task.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let connector = Arc::clone(self);
        tokio::spawn(async move {
            connector.run().await;
        })
    }

    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.tracker
            .transition(ConnState::Closing, TransitionReason::ShutdownRequested);
        let cmd = self.current_cmd.read().clone();
        if let Some(cmd) = cmd {
            let _ = cmd.send(ConnCommand::Close).await;
        }
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = BackoffCalculator::new(&self.config);

        'outer: loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.tracker
                .transition(ConnState::Connecting, TransitionReason::Started);

            let mut conn = self.open_connection();
            *self.current_cmd.write() = Some(conn.cmd_tx.clone());

            // Monitor this connection; rotation may swap it in place.
            let exit = loop {
                let event = if self.venue.needs_rotation() {
                    let lifetime = Duration::from_secs(self.config.connection_lifetime_secs);
                    let lead = Duration::from_secs(self.config.rotation_lead_secs);
                    let deadline = conn.opened_at + lifetime.saturating_sub(lead);
                    tokio::select! {
                        exit = &mut conn.join => {
                            MonitorEvent::Exited(exit.unwrap_or(ConnExit::NetworkError))
                        }
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                            MonitorEvent::RotationDue
                        }
                    }
                } else {
                    MonitorEvent::Exited((&mut conn.join).await.unwrap_or(ConnExit::NetworkError))
                };

                match event {
                    MonitorEvent::Exited(exit) => break exit,
                    MonitorEvent::RotationDue => {
                        conn = self.rotate(conn).await;
                        *self.current_cmd.write() = Some(conn.cmd_tx.clone());
                    }
                }
            };

            *self.current_cmd.write() = None;
            if self.shutdown.load(Ordering::SeqCst) || exit == ConnExit::SinkClosed {
                break;
            }

            // A connection that actually streamed resets the backoff ladder.
            if conn.connected.load(Ordering::SeqCst) && conn.produced.load(Ordering::Relaxed) > 0 {
                backoff.reset();
            }

            let reason = match exit {
                ConnExit::PongTimeout => TransitionReason::PongTimeout,
                ConnExit::DataStale => TransitionReason::DataStale,
                ConnExit::ServerClose | ConnExit::CleanClose => TransitionReason::ServerClose,
                ConnExit::ConnectTimeout => TransitionReason::ConnectTimeout,
                _ => TransitionReason::NetworkError,
            };
            self.tracker.transition(ConnState::Reconnecting, reason);

            if backoff.attempt() >= self.config.max_reconnect_attempts {
                error!(
                    venue = %self.venue,
                    attempts = backoff.attempt(),
                    "reconnect attempt cap exceeded; giving up"
                );
                break 'outer;
            }

            let delay = backoff.next_backoff();
            info!(
                venue = %self.venue,
                backoff_ms = delay.as_millis() as u64,
                attempt = backoff.attempt(),
                "reconnect_backoff"
            );
            tokio::time::sleep(delay).await;
        }

        self.tracker
            .transition(ConnState::Closed, TransitionReason::ShutdownRequested);
        info!(venue = %self.venue, metrics = %self.tracker.metrics.summary(), "connector_stopped");
    }

    fn open_connection(&self) -> ConnectionHandle {
        let streams: Vec<String> = self.streams.read().iter().cloned().collect();
        Connection::open(
            self.venue,
            self.ws_url.clone(),
            streams,
            self.config.clone(),
            Arc::clone(&self.tracker),
            self.sink.clone(),
        )
    }

    /// Zero-gap rotation: returns the surviving connection.
    async fn rotate(&self, primary: ConnectionHandle) -> ConnectionHandle {
        self.tracker
            .transition(ConnState::Rotating, TransitionReason::RotationDue);
        info!(venue = %self.venue, "rotation_started");

        let secondary = self.open_connection();

        // The secondary must produce trades before the primary retires.
        let warmup_deadline = tokio::time::Instant::now()
            + self.config.connect_timeout()
            + self.config.subscribe_timeout()
            + Duration::from_secs(30);
        loop {
            if secondary.produced.load(Ordering::Relaxed) > 0 {
                break;
            }
            if secondary.join.is_finished() || tokio::time::Instant::now() >= warmup_deadline {
                warn!(venue = %self.venue, "rotation secondary failed to warm up; keeping primary");
                secondary.join.abort();
                self.tracker
                    .transition(ConnState::Connected, TransitionReason::RotationComplete);
                return primary;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Drain and close the old connection; overlap is deduplicated
        // downstream by trade id.
        let _ = primary.cmd_tx.send(ConnCommand::Close).await;
        let _ = tokio::time::timeout(Duration::from_secs(10), primary.join).await;

        self.tracker
            .transition(ConnState::Connected, TransitionReason::RotationComplete);
        info!(venue = %self.venue, "rotation_complete");
        secondary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Fake venue that serves every accepted connection a numbered trade
    /// stream starting at the given id, a new connection per accept.
    async fn spawn_fake_venue(ids_per_conn: Vec<Vec<u64>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for ids in ids_per_conn {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    // Swallow the SUBSCRIBE frame.
                    let _ = ws.next().await;
                    for id in ids {
                        let frame = format!(
                            r#"{{"e":"aggTrade","E":{id},"s":"BTCUSDT","a":{id},"p":"100.0","q":"1","T":{id},"m":false}}"#
                        );
                        if ws.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    // Hold the connection open until the client closes.
                    while let Some(Ok(msg)) = ws.next().await {
                        if matches!(msg, Message::Close(_)) {
                            return;
                        }
                    }
                });
            }
        });

        format!("ws://{}", addr)
    }

    fn test_session() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.subscribe_batch_pause_ms = 1;
        config.backoff_base_ms = 10;
        config.backoff_max_ms = 50;
        config.connect_timeout_ms = 2_000;
        config
    }

    #[tokio::test]
    async fn reconnects_after_server_drop() {
        // First connection delivers 1..=3 then the server keeps it open;
        // we close it by dropping... simpler: server sends 3 trades then
        // closes; second accept sends 4..=6.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for batch in [vec![1u64, 2, 3], vec![4, 5, 6]] {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let _ = ws.next().await;
                for id in batch {
                    let frame = format!(
                        r#"{{"e":"aggTrade","E":{id},"s":"BTCUSDT","a":{id},"p":"100.0","q":"1","T":{id},"m":false}}"#
                    );
                    let _ = ws.send(Message::Text(frame)).await;
                }
                let _ = ws.close(None).await;
            }
        });

        let (sink_tx, mut sink_rx) = mpsc::channel(64);
        let connector = VenueConnector::new(
            Venue::Binance,
            format!("ws://{}", addr),
            test_session(),
            sink_tx,
        );
        connector.subscribe_symbols(&["BTCUSDT".to_string()]).await;
        let task = connector.start();

        let mut seen = Vec::new();
        while seen.len() < 6 {
            let trade = tokio::time::timeout(Duration::from_secs(10), sink_rx.recv())
                .await
                .expect("timed out waiting for trades across reconnect")
                .unwrap();
            seen.push(trade.trade_id);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
        assert!(connector.tracker().metrics.reconnections.load(Ordering::Relaxed) >= 1);

        connector.stop().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }

    #[tokio::test]
    async fn rotation_overlaps_without_losing_trades() {
        // Rotation due almost immediately; primary serves 1..=100 slowly,
        // secondary serves 90..=200. The union must cover 1..=200.
        let url = spawn_fake_venue(vec![(1..=100).collect(), (90..=200).collect()]).await;

        let mut config = test_session();
        config.connection_lifetime_secs = 1;
        config.rotation_lead_secs = 0;

        let (sink_tx, mut sink_rx) = mpsc::channel(1024);
        let connector = VenueConnector::new(Venue::Binance, url, config, sink_tx);
        connector.subscribe_symbols(&["BTCUSDT".to_string()]).await;
        let task = connector.start();

        let mut ids = std::collections::BTreeSet::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !(1..=200).all(|id| ids.contains(&id)) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let trade = tokio::time::timeout(remaining, sink_rx.recv())
                .await
                .expect("timed out before rotation delivered all ids")
                .unwrap();
            ids.insert(trade.trade_id);
        }

        assert!(connector.tracker().metrics.rotations.load(Ordering::Relaxed) >= 1);
        connector.stop().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
}
