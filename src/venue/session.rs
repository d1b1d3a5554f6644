//! Venue connection session management.
//!
//! State machine with well-defined transitions, exponential backoff with
//! jitter, heartbeat monitoring (ping/pong plus data staleness) and session
//! metrics. The hot path records liveness with a single store; everything
//! else lives on the cold path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::info;

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    // Backoff
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    /// Give up reconnecting after this many consecutive failures.
    pub max_reconnect_attempts: u32,

    // Timeouts
    pub connect_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,

    // Heartbeat
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub stale_data_timeout_ms: u64,

    // Subscription batching
    pub subscribe_batch_size: usize,
    pub subscribe_batch_pause_ms: u64,

    /// Open the secondary connection this long before the venue's hard
    /// connection lifetime.
    pub rotation_lead_secs: u64,
    /// Venue hard connection lifetime (24h on Binance).
    pub connection_lifetime_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
            max_reconnect_attempts: 30,

            connect_timeout_ms: 10_000,
            subscribe_timeout_ms: 5_000,

            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            stale_data_timeout_ms: 60_000,

            subscribe_batch_size: 50,
            subscribe_batch_pause_ms: 100,

            // Rotate 30 minutes before the 24h hard close.
            rotation_lead_secs: 30 * 60,
            connection_lifetime_secs: 24 * 3600,
        }
    }
}

impl SessionConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("FLOWTRACE_WS_BACKOFF_BASE_MS") {
            config.backoff_base_ms = v.parse().unwrap_or(config.backoff_base_ms);
        }
        if let Ok(v) = std::env::var("FLOWTRACE_WS_BACKOFF_MAX_MS") {
            config.backoff_max_ms = v.parse().unwrap_or(config.backoff_max_ms);
        }
        if let Ok(v) = std::env::var("FLOWTRACE_WS_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = v.parse().unwrap_or(config.connect_timeout_ms);
        }
        if let Ok(v) = std::env::var("FLOWTRACE_WS_STALE_TIMEOUT_MS") {
            config.stale_data_timeout_ms = v.parse().unwrap_or(config.stale_data_timeout_ms);
        }
        if let Ok(v) = std::env::var("FLOWTRACE_WS_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = v.parse().unwrap_or(config.max_reconnect_attempts);
        }
        if let Ok(v) = std::env::var("FLOWTRACE_WS_ROTATION_LEAD_SECS") {
            config.rotation_lead_secs = v.parse().unwrap_or(config.rotation_lead_secs);
        }

        config
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Secondary connection warming up before the primary retires.
    Rotating,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Rotating => "ROTATING",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    ConnectSuccess,
    ConnectTimeout,
    SubscribeTimeout,
    PongTimeout,
    DataStale,
    ServerClose,
    NetworkError,
    RotationDue,
    RotationComplete,
    ShutdownRequested,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::ConnectSuccess => "connect_ok",
            Self::ConnectTimeout => "connect_timeout",
            Self::SubscribeTimeout => "subscribe_timeout",
            Self::PongTimeout => "pong_timeout",
            Self::DataStale => "data_stale",
            Self::ServerClose => "server_close",
            Self::NetworkError => "network_error",
            Self::RotationDue => "rotation_due",
            Self::RotationComplete => "rotation_complete",
            Self::ShutdownRequested => "shutdown",
        };
        f.write_str(s)
    }
}

// =============================================================================
// BACKOFF WITH JITTER
// =============================================================================

/// Exponential backoff with jitter so a fleet of reconnecting processes
/// never stampedes the venue.
#[derive(Debug)]
pub struct BackoffCalculator {
    base_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E37_79B9_7F4A_7C15),
        }
    }

    /// xorshift64; plenty for jitter.
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let base = (self.base_ms as f64) * self.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.max_ms as f64);
        let jitter = (self.next_random() * 2.0 - 1.0) * capped * self.jitter_factor;
        let final_ms = (capped + jitter).max(self.base_ms as f64);
        self.attempt += 1;
        Duration::from_millis(final_ms as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// =============================================================================
// HEARTBEAT MONITOR
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Ok,
    SendPing,
    PongTimeout,
    DataStale,
}

/// Any received frame counts as liveness; staleness fires only when nothing
/// at all has arrived for the configured window.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    ping_interval: Duration,
    pong_timeout: Duration,
    stale_timeout: Duration,
    last_ping_sent: Option<Instant>,
    awaiting_pong: bool,
    last_frame_received: Instant,
}

impl HeartbeatMonitor {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            ping_interval: Duration::from_millis(config.ping_interval_ms),
            pong_timeout: Duration::from_millis(config.pong_timeout_ms),
            stale_timeout: Duration::from_millis(config.stale_data_timeout_ms),
            last_ping_sent: None,
            awaiting_pong: false,
            last_frame_received: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.last_ping_sent = None;
        self.awaiting_pong = false;
        self.last_frame_received = Instant::now();
    }

    #[inline]
    pub fn record_frame_received(&mut self) {
        self.last_frame_received = Instant::now();
    }

    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.awaiting_pong = true;
    }

    pub fn record_pong_received(&mut self) {
        self.awaiting_pong = false;
    }

    pub fn check(&mut self) -> HeartbeatAction {
        let now = Instant::now();

        if self.awaiting_pong {
            if let Some(sent) = self.last_ping_sent {
                if now.duration_since(sent) > self.pong_timeout {
                    return HeartbeatAction::PongTimeout;
                }
            }
        }

        if now.duration_since(self.last_frame_received) > self.stale_timeout {
            return HeartbeatAction::DataStale;
        }

        let due = match self.last_ping_sent {
            None => true,
            Some(sent) => now.duration_since(sent) > self.ping_interval,
        };
        if due && !self.awaiting_pong {
            return HeartbeatAction::SendPing;
        }

        HeartbeatAction::Ok
    }
}

// =============================================================================
// SESSION METRICS
// =============================================================================

#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub connections_attempted: AtomicU64,
    pub connections_succeeded: AtomicU64,
    pub reconnections: AtomicU64,
    pub rotations: AtomicU64,
    pub pong_timeouts: AtomicU64,
    pub data_stale_events: AtomicU64,
    pub frames_received: AtomicU64,
    pub trades_decoded: AtomicU64,
    pub decode_errors: AtomicU64,
}

impl SessionMetrics {
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} reconnects={} rotations={} pong_timeouts={} stale={} frames={} trades={} decode_errors={}",
            self.connections_succeeded.load(Ordering::Relaxed),
            self.connections_attempted.load(Ordering::Relaxed),
            self.reconnections.load(Ordering::Relaxed),
            self.rotations.load(Ordering::Relaxed),
            self.pong_timeouts.load(Ordering::Relaxed),
            self.data_stale_events.load(Ordering::Relaxed),
            self.frames_received.load(Ordering::Relaxed),
            self.trades_decoded.load(Ordering::Relaxed),
            self.decode_errors.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// SESSION TRACKER
// =============================================================================

/// Shared view of one connection's state, readable from health checks.
#[derive(Debug)]
pub struct SessionTracker {
    state: RwLock<ConnState>,
    connected_at: RwLock<Option<Instant>>,
    pub metrics: SessionMetrics,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ConnState::Disconnected),
            connected_at: RwLock::new(None),
            metrics: SessionMetrics::default(),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    pub fn transition(&self, new_state: ConnState, reason: TransitionReason) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        if old_state == new_state {
            return;
        }

        match new_state {
            ConnState::Connecting => {
                self.metrics.connections_attempted.fetch_add(1, Ordering::Relaxed);
            }
            ConnState::Connected => {
                self.metrics.connections_succeeded.fetch_add(1, Ordering::Relaxed);
                *self.connected_at.write() = Some(Instant::now());
            }
            ConnState::Reconnecting => {
                self.metrics.reconnections.fetch_add(1, Ordering::Relaxed);
                match reason {
                    TransitionReason::PongTimeout => {
                        self.metrics.pong_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    TransitionReason::DataStale => {
                        self.metrics.data_stale_events.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
            ConnState::Rotating => {
                self.metrics.rotations.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        info!(from = %old_state, to = %new_state, reason = %reason, "session_transition");
    }

    pub fn connection_age(&self) -> Option<Duration> {
        self.connected_at.read().map(|t| t.elapsed())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnState::Connected | ConnState::Rotating)
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}
