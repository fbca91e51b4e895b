//! Connection Manager
//!
//! Owns the transport for the lifetime of a client: dial, wait for the
//! server hello, send the auth/session handshake, then run the read loop
//! until the transport fails, and reconnect with backoff.
//!
//! # Flow
//!
//! ```text
//! supervise ──► run_connection ──► dial ─► await hello ─► handshake ─► pump
//!     ▲                                                                   │
//!     └──────── backoff (ReconnectPolicy) ◄──── transport error ◄─────────┘
//! ```
//!
//! Consumer commands arrive on an unbounded queue tagged with the
//! connection generation they were planned for. Commands planned for an
//! older generation are dropped; the handshake of the new connection
//! replays the subscription table instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Connector, CredentialProvider, FrameSink, FrameStream};
use crate::application::services::SharedState;
use crate::infrastructure::config::StreamConfig;
use crate::infrastructure::metrics;

use super::codec::{self, CodecError, Frame, FrameDecoder, HEARTBEAT_PREFIX, Message};
use super::commands::CommandPlanner;
use super::dispatcher::{Deliverer, dispatch};
use super::error::StreamError;
use super::heartbeat::{HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::{ServerError, ServerMessage};
use super::reconnect::ReconnectPolicy;

// =============================================================================
// Connection Status
// =============================================================================

/// Lifecycle of the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Disconnected,
    /// Dialing the service.
    Connecting,
    /// Transport open, waiting for the server hello.
    Handshaking,
    /// Handshake sent; data flows.
    Connected,
    /// Waiting out a backoff delay before the next dial.
    Reconnecting,
    /// `disconnect` was called. Terminal.
    Closed,
}

impl ConnectionState {
    /// Lowercase name, as used in logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    /// Whether the client is working towards a connection.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Connecting | Self::Handshaking | Self::Reconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Reconnect attempt in progress; zero once connected.
    pub attempt: u32,
    /// Most recent connection level error. Cleared on a successful
    /// handshake.
    pub last_error: Option<StreamError>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_error: None,
        }
    }
}

// =============================================================================
// Core
// =============================================================================

/// A request bound to the connection it was planned for.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) generation: u64,
    pub(crate) request: Request,
}

/// What the read loop is asked to do.
#[derive(Debug)]
pub(crate) enum Request {
    /// Write a planned command.
    Command(Message),
    /// Send a client heartbeat and report the time until the service next
    /// writes anything.
    Ping(oneshot::Sender<Duration>),
}

/// State shared by the client handle and the supervisor task.
pub(crate) struct Core {
    pub(crate) config: StreamConfig,
    pub(crate) planner: CommandPlanner,
    pub(crate) state: SharedState,
    pub(crate) status: watch::Sender<ConnectionStatus>,
    pub(crate) cancel: CancellationToken,
    /// Parked while no supervisor is running.
    pub(crate) command_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    pub(crate) reconnects: AtomicU64,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
}

impl Core {
    pub(crate) fn new(
        config: StreamConfig,
        state: SharedState,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        command_rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> Self {
        let planner = CommandPlanner::new(config.quote_fields.clone(), config.series_bar_count);
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            config,
            planner,
            state,
            status,
            cancel: CancellationToken::new(),
            command_rx: Mutex::new(Some(command_rx)),
            reconnects: AtomicU64::new(0),
            connector,
            credentials,
        }
    }

    /// Replace the whole status.
    pub(crate) fn publish(
        &self,
        state: ConnectionState,
        attempt: u32,
        last_error: Option<StreamError>,
    ) {
        metrics::set_connected(state == ConnectionState::Connected);
        self.status.send_replace(ConnectionStatus {
            state,
            attempt,
            last_error,
        });
    }

    /// Publish `Disconnected` and hand the command queue back for a later
    /// `connect`.
    ///
    /// The slot lock is held across both steps, so a `connect` that finds
    /// the queue always publishes after this `Disconnected`.
    fn park(&self, commands: mpsc::UnboundedReceiver<Outbound>, attempt: u32, error: StreamError) {
        let mut slot = self.command_rx.lock();
        self.publish(ConnectionState::Disconnected, attempt, Some(error));
        *slot = Some(commands);
    }

    /// Take the parked command queue and publish `Connecting`, under the
    /// same lock as [`park`](Self::park).
    pub(crate) fn unpark(&self) -> Option<mpsc::UnboundedReceiver<Outbound>> {
        let mut slot = self.command_rx.lock();
        let commands = slot.take()?;
        self.publish(ConnectionState::Connecting, 0, None);
        Some(commands)
    }

    /// Change the state, keeping attempt and last error.
    fn transition(&self, state: ConnectionState) {
        metrics::set_connected(state == ConnectionState::Connected);
        self.status.send_modify(|status| status.state = state);
    }

    fn record_error(&self, error: StreamError) {
        self.status.send_modify(|status| status.last_error = Some(error));
    }

    fn detach(&self) {
        self.state.lock().link = None;
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Run connections until cancelled, the command queue closes, or the
/// reconnect budget is spent. In the last case the queue is parked on
/// `core` so a later `connect` can start over.
pub(crate) async fn supervise(core: Arc<Core>, mut commands: mpsc::UnboundedReceiver<Outbound>) {
    let (deliverer, worker) = Deliverer::spawn(core.config.dispatch);
    let mut policy = ReconnectPolicy::new(core.config.reconnect.clone());
    let mut generation = 0_u64;

    loop {
        let result = tokio::select! {
            () = core.cancel.cancelled() => break,
            result = core.run_connection(&mut generation, &mut commands, &mut policy, &deliverer) => result,
        };
        core.detach();

        let error = match result {
            Ok(()) => break,
            Err(error) => error,
        };
        if core.cancel.is_cancelled() {
            break;
        }

        let Some(delay) = policy.next_delay() else {
            tracing::error!(
                attempts = policy.attempt_count(),
                error = %error,
                "reconnect attempts exhausted, giving up"
            );
            core.park(commands, policy.attempt_count(), error);
            break;
        };

        tracing::warn!(
            error = %error,
            attempt = policy.attempt_count(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "connection lost, reconnecting"
        );
        metrics::record_reconnect();
        core.reconnects.fetch_add(1, Ordering::Relaxed);
        core.publish(ConnectionState::Reconnecting, policy.attempt_count(), Some(error));

        tokio::select! {
            () = core.cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        core.transition(ConnectionState::Connecting);
    }

    drop(deliverer);
    if let Some(worker) = worker
        && let Err(e) = worker.await
    {
        tracing::error!(error = %e, "delivery worker failed");
    }
    tracing::debug!("connection supervisor stopped");
}

impl Core {
    /// One connection, from dial to transport failure.
    ///
    /// Returns `Ok` only when the client is shutting down.
    async fn run_connection(
        &self,
        generation: &mut u64,
        commands: &mut mpsc::UnboundedReceiver<Outbound>,
        policy: &mut ReconnectPolicy,
        deliverer: &Deliverer,
    ) -> Result<(), StreamError> {
        tracing::info!(url = %self.config.url, attempt = policy.attempt_count(), "connecting");

        let transport = tokio::time::timeout(self.config.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| {
                StreamError::Connection(format!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout
                ))
            })??;
        self.transition(ConnectionState::Handshaking);

        let mut stream = transport.stream;
        let mut link = Link::new(transport.sink);
        let backlog = tokio::time::timeout(
            self.config.handshake_timeout,
            link.await_hello(&mut stream),
        )
        .await
        .map_err(|_| {
            StreamError::Connection(format!(
                "no server hello within {:?}",
                self.config.handshake_timeout
            ))
        })??;

        let credential = self.credentials.credential()?;
        let handshake = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            *generation += 1;
            let handshake = self.planner.handshake(&mut state, credential.wire_token());
            state.link = Some(*generation);
            handshake
        };
        let generation = *generation;

        for message in handshake {
            link.send(message.encode()).await?;
        }
        policy.reset();

        self.publish(ConnectionState::Connected, 0, None);
        metrics::set_subscriptions(self.state.lock().subscriptions.counts());
        tracing::info!(
            generation,
            anonymous = credential.is_anonymous(),
            "connected"
        );

        self.pump(generation, link, stream, backlog, commands, deliverer)
            .await
    }

    /// Read loop of an established connection.
    async fn pump(
        &self,
        generation: u64,
        mut link: Link,
        mut stream: FrameStream,
        backlog: Vec<Result<Frame, CodecError>>,
        commands: &mut mpsc::UnboundedReceiver<Outbound>,
        deliverer: &Deliverer,
    ) -> Result<(), StreamError> {
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(4);
        let heartbeat_cancel = self.cancel.child_token();
        let _stop_heartbeat = heartbeat_cancel.clone().drop_guard();
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat.clone(),
                Arc::clone(&link.heartbeat),
                heartbeat_tx,
                heartbeat_cancel,
            )
            .run(),
        );

        self.handle_frames(generation, &mut link, backlog, deliverer)
            .await?;

        loop {
            tokio::select! {
                biased;

                Some(event) = heartbeat_rx.recv() => match event {
                    HeartbeatEvent::Keepalive(counter) => {
                        let token = format!("{HEARTBEAT_PREFIX}{counter}");
                        link.send(codec::heartbeat(&token)).await?;
                    }
                    HeartbeatEvent::Timeout => {
                        return Err(StreamError::Connection("heartbeat timeout".to_string()));
                    }
                },

                command = commands.recv() => match command {
                    Some(Outbound { generation: planned, request }) if planned == generation => match request {
                        Request::Command(message) => link.send(message.encode()).await?,
                        Request::Ping(reply) => link.ping(reply).await?,
                    },
                    Some(stale) => {
                        tracing::trace!(
                            request = ?stale.request,
                            planned = stale.generation,
                            "dropping request planned for a previous connection"
                        );
                    }
                    None => return Ok(()),
                },

                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        link.heartbeat.record_activity();
                        link.settle_pings();
                        metrics::record_frame_received();
                        let frames = link.decoder.feed(&chunk);
                        self.handle_frames(generation, &mut link, frames, deliverer).await?;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        tracing::debug!(echoed = link.heartbeat.echoed(), "transport closed by peer");
                        return Err(StreamError::Connection("transport closed by peer".to_string()));
                    }
                },
            }
        }
    }

    async fn handle_frames(
        &self,
        generation: u64,
        link: &mut Link,
        frames: Vec<Result<Frame, CodecError>>,
        deliverer: &Deliverer,
    ) -> Result<(), StreamError> {
        for frame in frames {
            let message = match frame {
                Ok(Frame::Message(message)) => message,
                Ok(Frame::Heartbeat(token)) => {
                    link.echo(&token).await?;
                    continue;
                }
                Ok(Frame::Hello(_)) => {
                    tracing::debug!("ignoring repeated server hello");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed frame");
                    metrics::record_protocol_error(e.kind());
                    continue;
                }
            };

            let method = message.method.clone();
            let message = match ServerMessage::parse(message) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(method = %method, error = %e, "dropping malformed message");
                    metrics::record_protocol_error(e.kind());
                    continue;
                }
            };

            let dispatched = {
                let mut state = self.state.lock();
                if state.link != Some(generation) {
                    continue;
                }
                dispatch(&mut state, message)
            };

            if let Some(detail) = dispatched.fault {
                self.record_error(StreamError::Connection(detail));
            }
            for command in dispatched.commands {
                link.send(command.encode()).await?;
            }
            deliverer.deliver(dispatched.deliveries).await;
        }
        Ok(())
    }
}

// =============================================================================
// Link
// =============================================================================

/// Write half and per-connection decode state.
struct Link {
    sink: FrameSink,
    decoder: FrameDecoder,
    heartbeat: Arc<HeartbeatState>,
    pings: Vec<(Instant, oneshot::Sender<Duration>)>,
}

impl Link {
    fn new(sink: FrameSink) -> Self {
        Self {
            sink,
            decoder: FrameDecoder::new(),
            heartbeat: Arc::new(HeartbeatState::new()),
            pings: Vec::new(),
        }
    }

    async fn ping(&mut self, reply: oneshot::Sender<Duration>) -> Result<(), StreamError> {
        let token = format!("{HEARTBEAT_PREFIX}{}", self.heartbeat.next_token());
        let sent = Instant::now();
        self.send(codec::heartbeat(&token)).await?;
        self.pings.push((sent, reply));
        Ok(())
    }

    /// Answer every ping sent before this chunk arrived.
    fn settle_pings(&mut self) {
        for (sent, reply) in self.pings.drain(..) {
            let latency = sent.elapsed();
            metrics::record_ping(latency);
            let _ = reply.send(latency);
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), StreamError> {
        tracing::trace!(frame = %frame, "send");
        self.sink.send(frame).await.map_err(StreamError::from)
    }

    async fn echo(&mut self, token: &str) -> Result<(), StreamError> {
        self.send(codec::heartbeat(token)).await?;
        self.heartbeat.record_echo();
        metrics::record_heartbeat_echoed();
        tracing::trace!(token, "heartbeat echoed");
        Ok(())
    }

    /// Read until the server hello. Heartbeats are echoed meanwhile; frames
    /// that arrive in the same chunk after the hello are returned.
    async fn await_hello(
        &mut self,
        stream: &mut FrameStream,
    ) -> Result<Vec<Result<Frame, CodecError>>, StreamError> {
        loop {
            let chunk = match stream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(StreamError::Connection(
                        "transport closed before server hello".to_string(),
                    ));
                }
            };
            self.heartbeat.record_activity();
            metrics::record_frame_received();

            let mut frames = self.decoder.feed(&chunk).into_iter();
            while let Some(frame) = frames.next() {
                match frame {
                    Ok(Frame::Hello(hello)) => {
                        tracing::debug!(hello = %hello, "server hello");
                        return Ok(frames.collect());
                    }
                    Ok(Frame::Heartbeat(token)) => self.echo(&token).await?,
                    Ok(Frame::Message(message)) => match ServerMessage::parse(message) {
                        Ok(ServerMessage::Error(
                            ServerError::Critical { detail } | ServerError::Protocol { detail },
                        )) => return Err(StreamError::Connection(detail)),
                        Ok(other) => {
                            tracing::debug!(kind = other.kind(), "ignoring message before hello");
                        }
                        Err(e) => {
                            metrics::record_protocol_error(e.kind());
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed frame before hello");
                        metrics::record_protocol_error(e.kind());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::application::ports::{MockCredentialProvider, Transport, TransportError};
    use crate::application::services::shared_state;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self) -> Result<Transport, TransportError> {
            Err(TransportError::Connect("unreachable".to_string()))
        }
    }

    fn core() -> (Arc<Core>, mpsc::UnboundedSender<Outbound>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let core = Core::new(
            StreamConfig::default(),
            shared_state(16),
            Arc::new(Unreachable),
            Arc::new(MockCredentialProvider::new()),
            command_rx,
        );
        (Arc::new(core), commands)
    }

    #[test]
    fn restart_after_give_up_is_never_overwritten() {
        for _ in 0..50 {
            let (core, _commands) = core();
            let queue = core.unpark().unwrap();

            let giving_up = {
                let core = Arc::clone(&core);
                std::thread::spawn(move || {
                    core.park(queue, 3, StreamError::Connection("refused".to_string()));
                })
            };
            let restarted = loop {
                if let Some(queue) = core.unpark() {
                    break queue;
                }
                std::thread::yield_now();
            };
            giving_up.join().unwrap();

            let status = core.status.borrow().clone();
            assert_eq!(status.state, ConnectionState::Connecting);
            assert!(status.last_error.is_none());
            drop(restarted);
        }
    }

    #[test]
    fn parked_queue_is_taken_once() {
        let (core, _commands) = core();
        assert!(core.unpark().is_some());
        assert!(core.unpark().is_none());
        assert_eq!(core.status.borrow().state, ConnectionState::Connecting);
    }

    #[test]
    fn state_names_are_lowercase() {
        assert_eq!(ConnectionState::Handshaking.to_string(), "handshaking");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Reconnecting).unwrap(),
            "\"reconnecting\""
        );
    }

    #[test]
    fn transitional_states() {
        assert!(ConnectionState::Connecting.is_transitional());
        assert!(ConnectionState::Reconnecting.is_transitional());
        assert!(!ConnectionState::Connected.is_transitional());
        assert!(!ConnectionState::Closed.is_transitional());
    }

    #[test]
    fn default_status_is_disconnected() {
        let status = ConnectionStatus::default();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.attempt, 0);
        assert!(status.last_error.is_none());
    }
}
