//! End-to-end ingestion flow: fake venue WebSocket -> connector ->
//! orchestrator fan-out -> worker pool -> aggregator -> period files, with
//! an in-process sidecar serving state loads and flushes.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use flowtrace_backend::models::{AppConfig, Interval, SymbolConfig, Venue};
use flowtrace_backend::orchestrator::{IngestionOrchestrator, IngestionState};
use flowtrace_backend::pool::{PoolConfig, WorkerPool};
use flowtrace_backend::sidecar::SidecarServer;
use flowtrace_backend::storage::{FootprintFileStore, StoreQuery};
use flowtrace_backend::venue::{SessionConfig, StaticSymbolRepository};

const T0: i64 = 1_700_000_040_000; // aligned to the 1m grid

fn agg_trade_frame(id: u64, ts: i64, price: f64, qty: f64, maker: bool) -> String {
    format!(
        r#"{{"e":"aggTrade","E":{ts},"s":"BTCUSDT","a":{id},"p":"{price}","q":"{qty}","T":{ts},"m":{maker}}}"#
    )
}

/// Fake Binance: accepts connections forever; each connection gets the full
/// frame list after its SUBSCRIBE, then stays open.
async fn spawn_fake_venue(frames: Vec<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let frames = frames.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let _ = ws.next().await; // SUBSCRIBE
                for frame in frames {
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
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

async fn spawn_sidecar(dir: &std::path::Path) -> String {
    let socket = dir.join("sidecar.sock").to_string_lossy().into_owned();
    let server = Arc::new(SidecarServer::open_in_memory().unwrap());
    let path = socket.clone();
    tokio::spawn(async move {
        let _ = server.serve(&path).await;
    });
    for _ in 0..100 {
        if std::path::Path::new(&socket).exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    socket
}

struct Harness {
    orchestrator: Arc<IngestionOrchestrator>,
    store: Arc<FootprintFileStore>,
    _dir: tempfile::TempDir,
}

async fn build_harness(ws_url: &str, symbols: Vec<SymbolConfig>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let socket = spawn_sidecar(dir.path()).await;

    let config = AppConfig {
        data_dir: dir.path().join("data").to_string_lossy().into_owned(),
        sidecar_socket_path: socket.clone(),
        worker_count: 2,
        flush_interval_secs: 1,
        intervals: vec![Interval::M1],
        ..AppConfig::default()
    };

    let store = Arc::new(FootprintFileStore::new(&config.data_dir));
    let pool = WorkerPool::new(
        PoolConfig {
            worker_count: config.worker_count,
            socket_path: socket,
            flush_interval: Duration::from_millis(200),
            intervals: config.intervals.clone(),
            rpc_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        },
        Arc::clone(&store),
    );

    let mut session = SessionConfig::default();
    session.subscribe_batch_pause_ms = 1;
    session.backoff_base_ms = 10;
    let repo = Arc::new(
        StaticSymbolRepository::new(symbols)
            .with_ws_url(Venue::Binance, ws_url)
            .with_session_config(session),
    );

    let orchestrator = IngestionOrchestrator::new(config, repo, pool, Arc::clone(&store), None);
    Harness {
        orchestrator,
        store,
        _dir: dir,
    }
}

async fn wait_for_candles(
    store: &FootprintFileStore,
    min_count: usize,
    timeout: Duration,
) -> Vec<flowtrace_backend::models::FootprintCandle> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let candles = store
            .find_with_footprint("BTCUSDT", Venue::Binance, Interval::M1, StoreQuery::default())
            .unwrap();
        if candles.len() >= min_count {
            return candles;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {min_count} candles; have {}",
            candles.len()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn live_stream_builds_and_persists_candles() {
    // Three trades in one minute, one in the next: the first candle
    // completes and lands on disk with its footprint.
    let frames = vec![
        agg_trade_frame(1, T0 + 500, 100.0, 1.0, false),
        agg_trade_frame(2, T0 + 30_000, 100.2, 2.0, true),
        agg_trade_frame(3, T0 + 59_999, 100.1, 1.0, false),
        agg_trade_frame(4, T0 + 60_500, 100.3, 1.0, false),
    ];
    let ws_url = spawn_fake_venue(frames).await;
    let harness = build_harness(&ws_url, vec![SymbolConfig::new(Venue::Binance, "BTCUSDT", 0.1)]).await;

    harness.orchestrator.start_ingestion().await.unwrap();
    assert_eq!(harness.orchestrator.get_status(), IngestionState::Running);
    assert!(harness.orchestrator.is_healthy());

    let candles = wait_for_candles(&harness.store, 1, Duration::from_secs(20)).await;
    let c = &candles[0];
    assert_eq!(c.open_time, T0);
    assert_eq!(c.close_time, T0 + 59_999);
    assert!(c.complete);
    assert_eq!(c.open, 100.0);
    assert_eq!(c.high, 100.2);
    assert_eq!(c.low, 100.0);
    assert_eq!(c.close, 100.1);
    assert_eq!(c.volume, 4.0);
    assert_eq!(c.buy_volume, 2.0);
    assert_eq!(c.sell_volume, 2.0);
    assert_eq!(c.delta, 0.0);
    assert_eq!(c.delta_max, 1.0);
    assert_eq!(c.delta_min, -1.0);

    // Footprint joined by open time: bins 1000/1001/1002.
    assert_eq!(c.bins.len(), 3);
    assert_eq!(c.bins[&1000].buy_volume, 2.0);
    assert_eq!(c.bins[&1002].sell_volume, 2.0);
    assert_eq!(c.bins[&1001].buy_volume, 1.0);

    let health = harness.orchestrator.get_health_metrics();
    assert!(health.trades_received >= 4);
    assert_eq!(health.connectors.len(), 1);
    assert_eq!(health.connectors[0].venue, "BINANCE");

    harness.orchestrator.stop_ingestion().await;
    assert_eq!(harness.orchestrator.get_status(), IngestionState::Stopped);
}

#[tokio::test]
async fn duplicate_frames_counted_once() {
    // The venue replays trade 2 (overlap during reconnect/rotation); the
    // candle must count it once.
    let frames = vec![
        agg_trade_frame(1, T0 + 100, 100.0, 1.0, false),
        agg_trade_frame(2, T0 + 200, 100.0, 1.0, false),
        agg_trade_frame(2, T0 + 200, 100.0, 1.0, false),
        agg_trade_frame(3, T0 + 300, 100.0, 1.0, false),
        agg_trade_frame(4, T0 + 60_500, 100.0, 1.0, false),
    ];
    let ws_url = spawn_fake_venue(frames).await;
    let harness = build_harness(&ws_url, vec![SymbolConfig::new(Venue::Binance, "BTCUSDT", 0.1)]).await;
    harness.orchestrator.start_ingestion().await.unwrap();

    let candles = wait_for_candles(&harness.store, 1, Duration::from_secs(20)).await;
    assert_eq!(candles[0].trade_count, 3);
    assert_eq!(candles[0].volume, 3.0);

    harness.orchestrator.stop_ingestion().await;
}

#[tokio::test]
async fn standby_then_add_symbols() {
    let frames = vec![
        agg_trade_frame(1, T0 + 100, 100.0, 1.0, false),
        agg_trade_frame(2, T0 + 60_500, 100.1, 1.0, false),
    ];
    let ws_url = spawn_fake_venue(frames).await;

    // No active symbols: the orchestrator parks in standby.
    let harness = build_harness(&ws_url, vec![]).await;
    harness.orchestrator.start_ingestion().await.unwrap();
    assert_eq!(harness.orchestrator.get_status(), IngestionState::Standby);
    assert!(harness.orchestrator.is_healthy());

    // Dynamic add flips to running and subscribes on demand.
    harness
        .orchestrator
        .add_symbols(vec![SymbolConfig::new(Venue::Binance, "BTCUSDT", 0.1)])
        .await
        .unwrap();
    assert_eq!(harness.orchestrator.get_status(), IngestionState::Running);

    // Adding the same symbol again is a no-op.
    harness
        .orchestrator
        .add_symbols(vec![SymbolConfig::new(Venue::Binance, "BTCUSDT", 0.1)])
        .await
        .unwrap();

    let candles = wait_for_candles(&harness.store, 1, Duration::from_secs(20)).await;
    assert_eq!(candles[0].trade_count, 1);

    harness.orchestrator.stop_ingestion().await;
}

#[tokio::test]
async fn gap_then_urgent_recovery_matches_direct_feed() {
    // The stream skips ids 2..=3; the recovered trades are injected with
    // urgent priority before the candle completes, so the persisted candle
    // matches an unbroken feed.
    let frames = vec![
        agg_trade_frame(1, T0 + 100, 100.0, 1.0, false),
        agg_trade_frame(4, T0 + 400, 100.3, 1.0, false),
    ];
    let ws_url = spawn_fake_venue(frames).await;
    let harness = build_harness(&ws_url, vec![SymbolConfig::new(Venue::Binance, "BTCUSDT", 0.1)]).await;
    harness.orchestrator.start_ingestion().await.unwrap();

    // Wait for the gapped stream to land, then inject the recovery batch the
    // REST path would deliver.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let recovered = vec![
        flowtrace_backend::models::Trade {
            venue: Venue::Binance,
            symbol: "BTCUSDT".to_string(),
            trade_id: 2,
            event_time: T0 + 200,
            trade_time: T0 + 200,
            price: 100.1,
            price_raw: "100.1".to_string(),
            quantity: 2.0,
            is_buyer_maker: true,
        },
        flowtrace_backend::models::Trade {
            venue: Venue::Binance,
            symbol: "BTCUSDT".to_string(),
            trade_id: 3,
            event_time: T0 + 300,
            trade_time: T0 + 300,
            price: 100.2,
            price_raw: "100.2".to_string(),
            quantity: 1.0,
            is_buyer_maker: false,
        },
    ];
    harness
        .orchestrator
        .inject_recovered_trades("BTCUSDT", recovered)
        .await
        .unwrap();

    // Complete the candle with the next minute's trade.
    harness
        .orchestrator
        .inject_recovered_trades(
            "BTCUSDT",
            vec![flowtrace_backend::models::Trade {
                venue: Venue::Binance,
                symbol: "BTCUSDT".to_string(),
                trade_id: 5,
                event_time: T0 + 60_500,
                trade_time: T0 + 60_500,
                price: 100.4,
                price_raw: "100.4".to_string(),
                quantity: 1.0,
                is_buyer_maker: false,
            }],
        )
        .await
        .unwrap();

    let candles = wait_for_candles(&harness.store, 1, Duration::from_secs(20)).await;
    let c = &candles[0];
    assert_eq!(c.trade_count, 4);
    assert_eq!(c.first_trade_id, 1);
    assert_eq!(c.last_trade_id, 4);
    assert_eq!(c.open, 100.0);
    assert_eq!(c.close, 100.3);
    assert_eq!(c.high, 100.3);
    // Delta trajectory in id order: +1, -1, 0, +1.
    assert_eq!(c.delta_max, 1.0);
    assert_eq!(c.delta_min, -1.0);

    harness.orchestrator.stop_ingestion().await;
}

#[tokio::test]
async fn paginated_query_over_live_data() {
    // Five one-minute candles completed by a sixth-minute trade.
    let mut frames = Vec::new();
    let mut id = 0u64;
    for minute in 0..6 {
        id += 1;
        frames.push(agg_trade_frame(id, T0 + minute * 60_000 + 100, 100.0 + minute as f64, 1.0, false));
    }
    let ws_url = spawn_fake_venue(frames).await;
    let harness = build_harness(&ws_url, vec![SymbolConfig::new(Venue::Binance, "BTCUSDT", 0.1)]).await;
    harness.orchestrator.start_ingestion().await.unwrap();

    wait_for_candles(&harness.store, 5, Duration::from_secs(20)).await;
    let page = harness
        .store
        .find_paginated(
            "BTCUSDT",
            Venue::Binance,
            Interval::M1,
            StoreQuery::default(),
            2,
            2,
        )
        .unwrap();
    assert_eq!(page.total_count, 5);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.candles.len(), 2);
    assert_eq!(page.candles[0].open_time, T0 + 2 * 60_000);

    let latest = harness
        .store
        .find_latest("BTCUSDT", Venue::Binance, Interval::M1)
        .unwrap()
        .unwrap();
    assert_eq!(latest.open_time, T0 + 4 * 60_000);

    harness.orchestrator.stop_ingestion().await;
}
