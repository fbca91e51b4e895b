//! Stream Client
//!
//! The consumer facing handle. Every call is synchronous against the shared
//! state except `connect`, `disconnect` and the `wait_for_*` family.
//!
//! Mutating calls (`subscribe`, `add_study`, ...) update the subscription
//! table and plan the wire commands while holding the state lock, then
//! queue the commands for the connection they were planned for. While no
//! connection is up nothing is queued; the next handshake replays the
//! table.
//!
//! # Usage
//!
//! ```ignore
//! use std::time::Duration;
//! use quote_stream::{StreamClient, StreamConfig};
//!
//! let client = StreamClient::from_config(StreamConfig::default())?;
//! client.connect().await?;
//! client.subscribe("THYAO")?;
//! let quote = client.wait_for_quote("THYAO", Duration::from_secs(5)).await?;
//! println!("{:?}", quote.last());
//! client.disconnect().await;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::application::ports::{Connector, CredentialProvider, ExchangeResolver, SymbolResolver};
use crate::application::services::{CallbackId, StreamState, shared_state};
use crate::domain::market::{
    Candle, ChartKey, Indicator, Interval, Quote, StudyKey, StudyParams, StudyValues, Symbol,
    normalize_symbol,
};
use crate::domain::subscription::{ActiveSubscriptions, SubscriptionCounts, SubscriptionError};
use crate::infrastructure::config::{OfflinePolicy, StreamConfig};
use crate::infrastructure::metrics;

use super::auth;
use super::codec::Message;
use super::commands::CommandPlanner;
use super::connection::{ConnectionState, ConnectionStatus, Core, Outbound, Request, supervise};
use super::error::StreamError;
use super::transport::WebSocketConnector;

/// Streaming market data client.
///
/// Cheap to clone; clones share one connection. The connection is shut
/// down by [`disconnect`](Self::disconnect) or when the last clone is
/// dropped.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<ClientHandle>,
}

struct ClientHandle {
    core: Arc<Core>,
    resolver: Arc<dyn SymbolResolver>,
    commands: mpsc::UnboundedSender<Outbound>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.core.cancel.cancel();
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("url", &self.inner.core.config.url)
            .field("state", &self.status().state)
            .finish_non_exhaustive()
    }
}

/// Outcome of the locked half of a wait.
enum Wait<V> {
    Ready(V),
    Pending(oneshot::Receiver<V>),
}

impl StreamClient {
    /// Client with explicit collaborators. Nothing is dialed until
    /// [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        config: StreamConfig,
        connector: Arc<dyn Connector>,
        resolver: Arc<dyn SymbolResolver>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let state = shared_state(config.candle_capacity);
        let core = Core::new(config, state, connector, credentials, command_rx);
        Self {
            inner: Arc::new(ClientHandle {
                core: Arc::new(core),
                resolver,
                commands,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Client for the WebSocket endpoint in `config`, resolving bare
    /// tickers against `config.default_exchange`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Auth`] if a configured token is blank.
    pub fn from_config(config: StreamConfig) -> Result<Self, StreamError> {
        let connector = Arc::new(WebSocketConnector::new(&config.url, &config.origin));
        let resolver = Arc::new(ExchangeResolver::new(&config.default_exchange));
        let credentials: Arc<dyn CredentialProvider> =
            Arc::from(auth::from_token(config.auth_token.as_deref())?);
        Ok(Self::new(config, connector, resolver, credentials))
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.inner.core.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the connection manager and wait for the first handshake.
    ///
    /// Returns immediately when already connected. On failure the manager
    /// keeps retrying in the background according to the reconnect policy.
    ///
    /// # Errors
    ///
    /// - [`StreamError::Closed`] after [`disconnect`](Self::disconnect).
    /// - The last connection error if the handshake did not complete within
    ///   `connect_timeout + handshake_timeout`, or the reconnect budget ran
    ///   out.
    pub async fn connect(&self) -> Result<(), StreamError> {
        let core = &self.inner.core;
        if core.state.lock().closed {
            return Err(StreamError::Closed);
        }

        let mut status = core.status.subscribe();
        if let Some(commands) = core.unpark() {
            let handle = tokio::spawn(supervise(Arc::clone(core), commands));
            if let Some(previous) = self.inner.supervisor.lock().replace(handle) {
                previous.abort();
            }
        }

        let deadline = core.config.connect_timeout + core.config.handshake_timeout;
        let settled = tokio::time::timeout(
            deadline,
            status.wait_for(|status| {
                matches!(
                    status.state,
                    ConnectionState::Connected
                        | ConnectionState::Disconnected
                        | ConnectionState::Closed
                )
            }),
        )
        .await;

        match settled {
            Ok(Ok(status)) => match status.state {
                ConnectionState::Connected => Ok(()),
                ConnectionState::Closed => Err(StreamError::Closed),
                _ => Err(status
                    .last_error
                    .clone()
                    .unwrap_or_else(|| StreamError::Connection("connection failed".to_string()))),
            },
            Ok(Err(_)) => Err(StreamError::Closed),
            Err(_) => Err(core.status.borrow().last_error.clone().unwrap_or_else(|| {
                StreamError::Connection(format!("not connected within {deadline:?}"))
            })),
        }
    }

    /// Close the client: stop the connection manager, release the
    /// transport and fail pending waits with [`StreamError::Closed`].
    ///
    /// Cached data stays readable. Idempotent.
    pub async fn disconnect(&self) {
        let core = &self.inner.core;
        {
            let mut state = core.state.lock();
            state.closed = true;
            state.link = None;
            state.drop_waiters();
        }
        core.cancel.cancel();

        let supervisor = self.inner.supervisor.lock().take();
        if let Some(supervisor) = supervisor
            && let Err(e) = supervisor.await
        {
            tracing::error!(error = %e, "connection supervisor failed");
        }

        core.publish(ConnectionState::Closed, 0, None);
        tracing::info!("stream client closed");
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.core.status.borrow().clone()
    }

    /// Receiver for status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.core.status.subscribe()
    }

    /// Status changes as a stream, starting with the current status.
    #[must_use]
    pub fn status_stream(&self) -> WatchStream<ConnectionStatus> {
        WatchStream::new(self.watch_status())
    }

    /// Whether a handshake has completed on the current connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.core.status.borrow().state == ConnectionState::Connected
    }

    /// Send a client heartbeat and measure how long the service takes to
    /// write anything back.
    ///
    /// # Errors
    ///
    /// [`StreamError::InvalidTimeout`] for a zero timeout,
    /// [`StreamError::Connection`] while no connection is up or when it
    /// drops before the reply, [`StreamError::Timeout`] when nothing
    /// arrives, and [`StreamError::Closed`] after `disconnect`.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, StreamError> {
        if timeout.is_zero() {
            return Err(StreamError::InvalidTimeout);
        }
        let generation = {
            let state = self.inner.core.state.lock();
            if state.closed {
                return Err(StreamError::Closed);
            }
            state
                .link
                .ok_or_else(|| StreamError::Connection("not connected".to_string()))?
        };

        let (reply, latency) = oneshot::channel();
        self.inner
            .commands
            .send(Outbound {
                generation,
                request: Request::Ping(reply),
            })
            .map_err(|_| StreamError::Closed)?;

        match tokio::time::timeout(timeout, latency).await {
            Ok(Ok(latency)) => Ok(latency),
            Ok(Err(_)) => Err(StreamError::Connection(
                "connection lost before the service replied".to_string(),
            )),
            Err(_) => Err(StreamError::Timeout {
                after: timeout,
                key: "ping".to_string(),
            }),
        }
    }

    /// Reconnect attempts since the client was created.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.inner.core.reconnects.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe to quote updates. Repeated calls are no-ops.
    ///
    /// # Errors
    ///
    /// Invalid or unresolvable symbol, [`SubscriptionError::NotConnected`]
    /// under the reject offline policy, or [`StreamError::Closed`].
    pub fn subscribe(&self, symbol: &str) -> Result<(), StreamError> {
        let symbol = parse_symbol(symbol)?;
        let exchange_symbol = self.inner.resolver.resolve(&symbol)?;
        self.apply(true, |planner, state| {
            let commands = planner.subscribe_quote(state, &symbol, &exchange_symbol);
            tracing::debug!(symbol = %symbol, exchange_symbol = %exchange_symbol, "quote subscribed");
            Ok(((), commands))
        })
    }

    /// Drop a quote subscription with its cached quote and symbol handlers.
    ///
    /// # Errors
    ///
    /// Invalid symbol or [`StreamError::Closed`].
    pub fn unsubscribe(&self, symbol: &str) -> Result<(), StreamError> {
        let symbol = parse_symbol(symbol)?;
        self.apply(false, |planner, state| {
            Ok(((), planner.unsubscribe_quote(state, &symbol)))
        })
    }

    /// Subscribe to candles for `symbol` at `interval`.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe), plus
    /// [`SubscriptionError::InvalidInterval`].
    pub fn subscribe_chart(&self, symbol: &str, interval: &str) -> Result<(), StreamError> {
        let key = parse_chart(symbol, interval)?;
        let exchange_symbol = self.inner.resolver.resolve(&key.symbol)?;
        self.apply(true, |planner, state| {
            let commands = planner.subscribe_chart(state, &key, &exchange_symbol);
            tracing::debug!(chart = %key, "chart subscribed");
            Ok(((), commands))
        })
    }

    /// Drop a chart subscription together with its studies.
    ///
    /// # Errors
    ///
    /// Invalid symbol or interval, or [`StreamError::Closed`].
    pub fn unsubscribe_chart(&self, symbol: &str, interval: &str) -> Result<(), StreamError> {
        let key = parse_chart(symbol, interval)?;
        self.apply(false, |planner, state| {
            Ok(((), planner.unsubscribe_chart(state, &key)))
        })
    }

    /// Attach a server computed study to an active chart.
    ///
    /// `name` is a short indicator name (`RSI`, `MACD`, `BB`, ...) or a full
    /// script id. Returns the key the study's output is cached under.
    ///
    /// # Errors
    ///
    /// [`SubscriptionError::ChartNotActive`] unless the chart has delivered
    /// data, [`SubscriptionError::StudyConflict`] for the same study with
    /// different inputs, plus the errors of [`subscribe`](Self::subscribe).
    pub fn add_study(
        &self,
        symbol: &str,
        interval: &str,
        name: &str,
        params: StudyParams,
    ) -> Result<StudyKey, StreamError> {
        let chart = parse_chart(symbol, interval)?;
        let indicator = Indicator::resolve(name);
        let key = StudyKey::new(chart.symbol, chart.interval, indicator.name());
        self.apply(true, |planner, state| {
            let commands = planner.add_study(state, &key, indicator, params)?;
            tracing::debug!(study = %key, "study added");
            Ok((key.clone(), commands))
        })
    }

    /// Remove a study with its cached output and handlers.
    ///
    /// # Errors
    ///
    /// Invalid symbol or interval, or [`StreamError::Closed`].
    pub fn remove_study(&self, symbol: &str, interval: &str, name: &str) -> Result<(), StreamError> {
        let key = parse_study(symbol, interval, name)?;
        self.apply(false, |planner, state| {
            Ok(((), planner.remove_study(state, &key)))
        })
    }

    /// Symbols with a quote subscription.
    #[must_use]
    pub fn subscribed_symbols(&self) -> Vec<Symbol> {
        self.inner.core.state.lock().subscriptions.symbols()
    }

    /// Charts with a candle subscription.
    #[must_use]
    pub fn chart_subscriptions(&self) -> Vec<ChartKey> {
        self.inner.core.state.lock().subscriptions.charts()
    }

    /// Subscription counts by kind.
    #[must_use]
    pub fn subscription_counts(&self) -> SubscriptionCounts {
        self.inner.core.state.lock().subscriptions.counts()
    }

    /// Subscriptions a reconnect would replay.
    #[must_use]
    pub fn active_subscriptions(&self) -> ActiveSubscriptions {
        self.inner.core.state.lock().subscriptions.active_subscriptions()
    }

    /// Run `plan` under the state lock and queue what it returns for the
    /// live connection.
    fn apply<T>(
        &self,
        requires_link: bool,
        plan: impl FnOnce(&CommandPlanner, &mut StreamState) -> Result<(T, Vec<Message>), StreamError>,
    ) -> Result<T, StreamError> {
        let core = &self.inner.core;
        let mut state = core.state.lock();
        if state.closed {
            return Err(StreamError::Closed);
        }
        if requires_link
            && core.config.offline_policy == OfflinePolicy::Reject
            && state.link.is_none()
        {
            return Err(SubscriptionError::NotConnected.into());
        }

        let (value, messages) = plan(&core.planner, &mut state)?;
        if let Some(generation) = state.link {
            for message in messages {
                // The receiver only goes away with the client itself.
                let _ = self.inner.commands.send(Outbound {
                    generation,
                    request: Request::Command(message),
                });
            }
        }
        metrics::set_subscriptions(state.subscriptions.counts());
        Ok(value)
    }

    // =========================================================================
    // Cache
    // =========================================================================

    /// Latest quote for `symbol`.
    #[must_use]
    pub fn get_quote(&self, symbol: &str) -> Option<Quote> {
        let symbol = normalize_symbol(symbol)?;
        self.inner.core.state.lock().cache.get_quote(&symbol)
    }

    /// Latest quote of every symbol.
    #[must_use]
    pub fn get_all_quotes(&self) -> BTreeMap<Symbol, Quote> {
        self.inner.core.state.lock().cache.all_quotes()
    }

    /// Newest bar of a chart.
    #[must_use]
    pub fn get_candle(&self, symbol: &str, interval: &str) -> Option<Candle> {
        let key = parse_chart(symbol, interval).ok()?;
        self.inner.core.state.lock().cache.get_candle(&key)
    }

    /// Buffered bars of a chart, oldest first; the newest `limit` when
    /// given.
    #[must_use]
    pub fn get_candles(&self, symbol: &str, interval: &str, limit: Option<usize>) -> Vec<Candle> {
        let Ok(key) = parse_chart(symbol, interval) else {
            return Vec::new();
        };
        self.inner.core.state.lock().cache.get_candles(&key, limit)
    }

    /// Latest output of a study.
    #[must_use]
    pub fn get_study(&self, symbol: &str, interval: &str, name: &str) -> Option<StudyValues> {
        let key = parse_study(symbol, interval, name).ok()?;
        self.inner.core.state.lock().cache.get_study(&key)
    }

    /// Latest output of every study on a chart, by study name.
    #[must_use]
    pub fn get_studies(&self, symbol: &str, interval: &str) -> BTreeMap<String, StudyValues> {
        let Ok(key) = parse_chart(symbol, interval) else {
            return BTreeMap::new();
        };
        self.inner
            .core
            .state
            .lock()
            .cache
            .get_studies(&key.symbol, key.interval)
    }

    /// Drop every cached value. Subscriptions are kept.
    pub fn clear_cache(&self) {
        self.inner.core.state.lock().cache.clear();
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// The cached quote, or the next one to arrive within `timeout`.
    ///
    /// # Errors
    ///
    /// [`StreamError::InvalidTimeout`] for a zero timeout,
    /// [`StreamError::Timeout`] when nothing arrives, and
    /// [`StreamError::Closed`] if the client is closed meanwhile.
    pub async fn wait_for_quote(&self, symbol: &str, timeout: Duration) -> Result<Quote, StreamError> {
        let symbol = parse_symbol(symbol)?;
        let label = symbol.clone();
        let stale = symbol.clone();
        self.wait(
            label,
            timeout,
            move |state| match state.cache.get_quote(&symbol) {
                Some(quote) => Wait::Ready(quote),
                None => Wait::Pending(state.quote_waiters.register(symbol)),
            },
            move |state| state.quote_waiters.prune(&stale),
        )
        .await
    }

    /// The newest cached bar, or the next one to arrive within `timeout`.
    ///
    /// # Errors
    ///
    /// As for [`wait_for_quote`](Self::wait_for_quote).
    pub async fn wait_for_candle(
        &self,
        symbol: &str,
        interval: &str,
        timeout: Duration,
    ) -> Result<Candle, StreamError> {
        let key = parse_chart(symbol, interval)?;
        let label = key.to_string();
        let stale = key.clone();
        self.wait(
            label,
            timeout,
            move |state| match state.cache.get_candle(&key) {
                Some(candle) => Wait::Ready(candle),
                None => Wait::Pending(state.candle_waiters.register(key)),
            },
            move |state| state.candle_waiters.prune(&stale),
        )
        .await
    }

    /// The cached study output, or the next one to arrive within
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// As for [`wait_for_quote`](Self::wait_for_quote).
    pub async fn wait_for_study(
        &self,
        symbol: &str,
        interval: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<StudyValues, StreamError> {
        let key = parse_study(symbol, interval, name)?;
        let label = key.to_string();
        let stale = key.clone();
        self.wait(
            label,
            timeout,
            move |state| match state.cache.get_study(&key) {
                Some(values) => Wait::Ready(values),
                None => Wait::Pending(state.study_waiters.register(key)),
            },
            move |state| state.study_waiters.prune(&stale),
        )
        .await
    }

    /// Check the cache and register the waiter under one lock, so an update
    /// cannot slip in between. On timeout `abandon` drops what the wait left
    /// behind.
    async fn wait<V>(
        &self,
        key: String,
        timeout: Duration,
        lookup: impl FnOnce(&mut StreamState) -> Wait<V>,
        abandon: impl FnOnce(&mut StreamState),
    ) -> Result<V, StreamError> {
        if timeout.is_zero() {
            return Err(StreamError::InvalidTimeout);
        }

        let receiver = {
            let mut state = self.inner.core.state.lock();
            if state.closed {
                return Err(StreamError::Closed);
            }
            match lookup(&mut state) {
                Wait::Ready(value) => return Ok(value),
                Wait::Pending(receiver) => receiver,
            }
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(StreamError::Closed),
            Err(_) => {
                abandon(&mut self.inner.core.state.lock());
                Err(StreamError::Timeout {
                    after: timeout,
                    key,
                })
            }
        }
    }

    // =========================================================================
    // Callbacks
    // =========================================================================

    /// Call `handler` on every quote update for `symbol`.
    ///
    /// Handlers run outside the state lock and may call back into the
    /// client. A panicking handler is logged and skipped.
    ///
    /// # Errors
    ///
    /// [`SubscriptionError::InvalidSymbol`].
    pub fn on_quote(
        &self,
        symbol: &str,
        handler: impl Fn(&Quote) + Send + Sync + 'static,
    ) -> Result<CallbackId, StreamError> {
        let symbol = parse_symbol(symbol)?;
        Ok(self
            .inner
            .core
            .state
            .lock()
            .callbacks
            .add_quote(Some(symbol), Arc::new(handler)))
    }

    /// Call `handler` on every quote update.
    pub fn on_any_quote(&self, handler: impl Fn(&Quote) + Send + Sync + 'static) -> CallbackId {
        self.inner
            .core
            .state
            .lock()
            .callbacks
            .add_quote(None, Arc::new(handler))
    }

    /// Call `handler` with the newest bar after every update of a chart.
    ///
    /// # Errors
    ///
    /// Invalid symbol or interval.
    pub fn on_candle(
        &self,
        symbol: &str,
        interval: &str,
        handler: impl Fn(&ChartKey, &Candle) + Send + Sync + 'static,
    ) -> Result<CallbackId, StreamError> {
        let key = parse_chart(symbol, interval)?;
        Ok(self
            .inner
            .core
            .state
            .lock()
            .callbacks
            .add_candle(Some(key), Arc::new(handler)))
    }

    /// Call `handler` on every candle update.
    pub fn on_any_candle(
        &self,
        handler: impl Fn(&ChartKey, &Candle) + Send + Sync + 'static,
    ) -> CallbackId {
        self.inner
            .core
            .state
            .lock()
            .callbacks
            .add_candle(None, Arc::new(handler))
    }

    /// Call `handler` on every output of a study.
    ///
    /// # Errors
    ///
    /// Invalid symbol or interval.
    pub fn on_study(
        &self,
        symbol: &str,
        interval: &str,
        name: &str,
        handler: impl Fn(&StudyKey, &StudyValues) + Send + Sync + 'static,
    ) -> Result<CallbackId, StreamError> {
        let key = parse_study(symbol, interval, name)?;
        Ok(self
            .inner
            .core
            .state
            .lock()
            .callbacks
            .add_study(Some(key), Arc::new(handler)))
    }

    /// Call `handler` on every study update.
    pub fn on_any_study(
        &self,
        handler: impl Fn(&StudyKey, &StudyValues) + Send + Sync + 'static,
    ) -> CallbackId {
        self.inner
            .core
            .state
            .lock()
            .callbacks
            .add_study(None, Arc::new(handler))
    }

    /// Unregister a handler. Returns whether it was registered.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.inner.core.state.lock().callbacks.remove(id)
    }
}

// =============================================================================
// Key Parsing
// =============================================================================

fn parse_symbol(raw: &str) -> Result<Symbol, SubscriptionError> {
    normalize_symbol(raw).ok_or_else(|| SubscriptionError::InvalidSymbol(raw.to_string()))
}

fn parse_interval(raw: &str) -> Result<Interval, SubscriptionError> {
    raw.parse()
        .map_err(|_| SubscriptionError::InvalidInterval(raw.to_string()))
}

fn parse_chart(symbol: &str, interval: &str) -> Result<ChartKey, SubscriptionError> {
    Ok(ChartKey::new(parse_symbol(symbol)?, parse_interval(interval)?))
}

fn parse_study(symbol: &str, interval: &str, name: &str) -> Result<StudyKey, SubscriptionError> {
    let chart = parse_chart(symbol, interval)?;
    Ok(StudyKey::new(
        chart.symbol,
        chart.interval,
        Indicator::resolve(name).name(),
    ))
}
