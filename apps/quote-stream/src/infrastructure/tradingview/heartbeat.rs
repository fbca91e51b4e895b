//! Heartbeat Watchdog
//!
//! The service sends `~h~N` heartbeats that the read loop echoes straight
//! back. This watchdog covers the other direction: if nothing arrives for
//! half the timeout it asks the read loop to send a heartbeat of its own,
//! and if nothing arrives for the full timeout it reports the connection
//! dead so the supervisor reconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often inbound activity is checked.
    pub check_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(check_interval: Duration, timeout: Duration) -> Self {
        Self {
            check_interval,
            timeout,
        }
    }

    /// Silence after which a keepalive is sent.
    #[must_use]
    pub fn keepalive_after(&self) -> Duration {
        self.timeout / 2
    }
}

/// Events emitted by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a client heartbeat with this counter.
    Keepalive(u64),
    /// Nothing arrived within the timeout.
    Timeout,
}

/// Activity shared between the watchdog and the read loop.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
    keepalive_pending: AtomicBool,
    counter: AtomicU64,
    echoed: AtomicU64,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
            keepalive_pending: AtomicBool::new(false),
            counter: AtomicU64::new(0),
            echoed: AtomicU64::new(0),
        }
    }

    /// Record that a chunk arrived.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
        self.keepalive_pending.store(false, Ordering::SeqCst);
    }

    /// Record that a server heartbeat was echoed.
    pub fn record_echo(&self) {
        self.echoed.fetch_add(1, Ordering::Relaxed);
    }

    /// Server heartbeats echoed on this connection.
    #[must_use]
    pub fn echoed(&self) -> u64 {
        self.echoed.load(Ordering::Relaxed)
    }

    /// Time since the last inbound chunk.
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Whether a keepalive was sent and nothing has arrived since.
    #[must_use]
    pub fn is_keepalive_pending(&self) -> bool {
        self.keepalive_pending.load(Ordering::SeqCst)
    }

    fn next_keepalive(&self) -> u64 {
        self.keepalive_pending.store(true, Ordering::SeqCst);
        self.next_token()
    }

    /// Counter for a client heartbeat sent on request. Shares the sequence
    /// with keepalives but leaves the watchdog alone.
    pub fn next_token(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Watchdog over inbound activity of one connection.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or a timeout is reported.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("heartbeat watchdog cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.check().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `Err(())` when the loop should exit.
    async fn check(&self) -> Result<(), ()> {
        let idle = self.state.idle();

        if idle > self.config.timeout {
            tracing::warn!(
                idle_secs = idle.as_secs(),
                timeout_secs = self.config.timeout.as_secs(),
                "heartbeat timeout detected"
            );
            let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
            return Err(());
        }

        if idle > self.config.keepalive_after() && !self.state.is_keepalive_pending() {
            let counter = self.state.next_keepalive();
            tracing::debug!(idle_secs = idle.as_secs(), counter, "connection idle, probing");
            if self.event_tx.send(HeartbeatEvent::Keepalive(counter)).await.is_err() {
                tracing::debug!("event channel closed, stopping heartbeat watchdog");
                return Err(());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.keepalive_after(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_clears_pending_keepalive() {
        let state = HeartbeatState::new();
        assert_eq!(state.next_keepalive(), 1);
        assert!(state.is_keepalive_pending());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(state.idle() >= Duration::from_secs(3));

        state.record_activity();
        assert!(!state.is_keepalive_pending());
        assert!(state.idle() < Duration::from_secs(1));
        assert_eq!(state.next_keepalive(), 2);
    }

    #[test]
    fn requested_heartbeats_share_the_counter() {
        let state = HeartbeatState::new();
        assert_eq!(state.next_token(), 1);
        assert!(!state.is_keepalive_pending());
        assert_eq!(state.next_keepalive(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_gets_keepalive_then_times_out() {
        let config = HeartbeatConfig::new(Duration::from_secs(1), Duration::from_secs(10));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone()).run(),
        );

        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::Keepalive(1)));
        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::Timeout));
        handle.await.unwrap();
        assert!(state.idle() > Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn steady_traffic_sends_nothing() {
        let config = HeartbeatConfig::new(Duration::from_secs(1), Duration::from_secs(10));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone()).run(),
        );

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            state.record_activity();
        }
        assert!(event_rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
    }
}
