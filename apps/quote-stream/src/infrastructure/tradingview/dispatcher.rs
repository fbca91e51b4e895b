//! Message Dispatcher
//!
//! Applies one inbound [`ServerMessage`] to the shared state and collects
//! what has to happen after the lock is released: deliveries to callbacks
//! and waiters, and follow-up commands (studies released by a chart
//! acknowledgement).
//!
//! # Routing
//!
//! | Message | State change |
//! |---------|--------------|
//! | `qsd` ok | quote `Active`, cache merged, delivery |
//! | `qsd` error | quote `Failed`, not cached |
//! | series data | chart `Active`, bars merged, newest bar delivered; study rows cached and delivered |
//! | chart ack | chart `Active`, queued studies released |
//! | study ack | study `Active` |
//! | series/symbol error | chart `Failed` |
//! | study error | study `Failed` |
//! | critical/protocol error | logged and reported as a fault |
//!
//! Messages for sessions that are not part of the current connection are
//! ignored; they belong to a subscription that was removed.

use std::time::Instant;

use tokio::sync::mpsc;

use crate::application::services::{Delivery, StreamState};
use crate::domain::cache::CandleMerge;
use crate::domain::market::ChartKey;
use crate::domain::subscription::SubscriptionState;
use crate::infrastructure::metrics;

use super::codec::Message;
use super::commands::study_commands;
use super::messages::{Ack, QuoteData, QuoteStatus, SeriesData, ServerError, ServerMessage};

/// How callbacks are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// On the read loop, before the next message is processed.
    #[default]
    Inline,
    /// On a dedicated worker fed by a bounded queue of this capacity.
    ///
    /// Delivery order is preserved; a full queue applies backpressure to
    /// the read loop.
    Worker(usize),
}

/// Outcome of dispatching one message.
#[derive(Debug, Default)]
pub struct Dispatched {
    /// Updates to hand to observers, in order.
    pub deliveries: Vec<Delivery>,
    /// Commands to write.
    pub commands: Vec<Message>,
    /// Connection level error reported by the service.
    pub fault: Option<String>,
}

/// Apply one message to `state`.
pub fn dispatch(state: &mut StreamState, message: ServerMessage) -> Dispatched {
    let kind = message.kind();
    let started = Instant::now();
    metrics::record_message(kind);

    let mut out = Dispatched::default();
    match message {
        ServerMessage::Quote { session, data } => on_quote(state, &session, data, &mut out),
        ServerMessage::Series(data) => on_series(state, data, &mut out),
        ServerMessage::Ack(ack) => on_ack(state, ack, &mut out),
        ServerMessage::Error(error) => on_error(state, error, &mut out),
        ServerMessage::Unknown(method) => {
            tracing::trace!(method = %method, "ignoring unknown method");
        }
    }

    metrics::record_dispatch_duration(kind, started.elapsed());
    out
}

fn on_quote(state: &mut StreamState, session: &str, data: QuoteData, out: &mut Dispatched) {
    if !state.sessions.is_quote_session(session) {
        tracing::trace!(session, "quote for a stale session");
        return;
    }
    let aliases = state.subscriptions.aliases(&data.name);
    if aliases.is_empty() {
        tracing::trace!(symbol = %data.name, "quote for an unsubscribed symbol");
        return;
    }

    if data.status == QuoteStatus::Error {
        for symbol in &aliases {
            if state.subscriptions.set_quote_state(symbol, SubscriptionState::Failed) {
                tracing::warn!(symbol = %symbol, exchange_symbol = %data.name, "quote subscription rejected");
            }
        }
        return;
    }

    state.sessions.activate_quote_session();
    for symbol in aliases {
        state.subscriptions.set_quote_state(&symbol, SubscriptionState::Active);
        let quote = state
            .cache
            .update_quote(&symbol, &data.name, data.fields.clone())
            .clone();

        out.deliveries.push(Delivery::Quote {
            handlers: state.callbacks.quote_handlers(&symbol),
            waiters: state.quote_waiters.take(&symbol),
            quote,
        });
    }
}

fn on_series(state: &mut StreamState, data: SeriesData, out: &mut Dispatched) {
    let Some(chart) = state.sessions.chart_for(&data.session).cloned() else {
        tracing::trace!(session = %data.session, "series data for a stale session");
        return;
    };
    activate_chart(state, &data.session, &chart, out);

    let mut changed = false;
    for bar in data.bars {
        let merge = state.cache.update_candle(&chart, bar);
        if merge == CandleMerge::Stale {
            tracing::trace!(chart = %chart, time = bar.time, "dropping out-of-order bar");
        }
        changed |= merge.changed();
    }
    if changed {
        if let Some(candle) = state.cache.get_candle(&chart) {
            out.deliveries.push(Delivery::Candle {
                handlers: state.callbacks.candle_handlers(&chart),
                waiters: state.candle_waiters.take(&chart),
                key: chart.clone(),
                candle,
            });
        }
    }

    for row in data.studies {
        let Some(key) = state.sessions.study_for(&data.session, &row.study_id).cloned() else {
            continue;
        };
        let Some(sub) = state.subscriptions.study(&key) else {
            continue;
        };
        let values = sub.indicator.map_row(&row.row);
        if values.is_empty() {
            continue;
        }
        state.subscriptions.set_study_state(&key, SubscriptionState::Active);
        state.cache.update_study(&key, values.clone());

        out.deliveries.push(Delivery::Study {
            handlers: state.callbacks.study_handlers(&key),
            waiters: state.study_waiters.take(&key),
            key,
            values,
        });
    }
}

fn on_ack(state: &mut StreamState, ack: Ack, out: &mut Dispatched) {
    match ack {
        Ack::QuoteCompleted { session, symbol } => {
            if !state.sessions.is_quote_session(&session) {
                return;
            }
            state.sessions.activate_quote_session();
            for alias in state.subscriptions.aliases(&symbol) {
                state.subscriptions.set_quote_state(&alias, SubscriptionState::Active);
            }
        }
        Ack::SymbolResolved { session } | Ack::SeriesCompleted { session } => {
            if let Some(chart) = state.sessions.chart_for(&session).cloned() {
                activate_chart(state, &session, &chart, out);
            }
        }
        Ack::StudyLoading { session, study_id } | Ack::StudyCompleted { session, study_id } => {
            if let Some(key) = state.sessions.study_for(&session, &study_id).cloned() {
                state.subscriptions.set_study_state(&key, SubscriptionState::Active);
            }
        }
    }
}

fn on_error(state: &mut StreamState, error: ServerError, out: &mut Dispatched) {
    match error {
        ServerError::Series { session, detail } | ServerError::Symbol { session, detail } => {
            if let Some(chart) = state.sessions.chart_for(&session).cloned() {
                if state.subscriptions.set_chart_state(&chart, SubscriptionState::Failed) {
                    tracing::warn!(chart = %chart, detail = %detail, "chart subscription failed");
                }
            }
        }
        ServerError::Study {
            session,
            study_id,
            detail,
        } => {
            if let Some(key) = state.sessions.study_for(&session, &study_id).cloned() {
                if state.subscriptions.set_study_state(&key, SubscriptionState::Failed) {
                    tracing::warn!(study = %key, detail = %detail, "study failed");
                }
            }
        }
        ServerError::Critical { detail } | ServerError::Protocol { detail } => {
            tracing::error!(detail = %detail, "service reported a connection error");
            out.fault = Some(detail);
        }
    }
}

/// First acknowledgement of a chart: mark it active and release the studies
/// queued on its session.
fn activate_chart(state: &mut StreamState, session: &str, chart: &ChartKey, out: &mut Dispatched) {
    if state.subscriptions.chart(chart).map(|sub| sub.state) != Some(SubscriptionState::Failed) {
        state.subscriptions.set_chart_state(chart, SubscriptionState::Active);
    }
    let released = state.sessions.activate_chart(session);
    if !released.is_empty() {
        tracing::debug!(chart = %chart, studies = released.len(), "releasing queued studies");
        out.commands.extend(study_commands(state, &released));
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// Runs deliveries either inline or on a worker task.
#[derive(Debug, Clone)]
pub enum Deliverer {
    /// Run on the caller.
    Inline,
    /// Hand to the worker.
    Worker(mpsc::Sender<Delivery>),
}

impl Deliverer {
    /// Deliverer for `mode`. The worker, if any, runs until every sender is
    /// dropped.
    #[must_use]
    pub fn spawn(mode: DispatchMode) -> (Self, Option<tokio::task::JoinHandle<()>>) {
        match mode {
            DispatchMode::Inline => (Self::Inline, None),
            DispatchMode::Worker(capacity) => {
                let (tx, mut rx) = mpsc::channel::<Delivery>(capacity.max(1));
                let handle = tokio::spawn(async move {
                    while let Some(delivery) = rx.recv().await {
                        metrics::record_callback_panics(delivery.deliver());
                    }
                    tracing::debug!("delivery worker stopped");
                });
                (Self::Worker(tx), Some(handle))
            }
        }
    }

    /// Deliver in order.
    pub async fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match self {
                Self::Inline => metrics::record_callback_panics(delivery.deliver()),
                Self::Worker(tx) => {
                    if let Err(mpsc::error::SendError(delivery)) = tx.send(delivery).await {
                        // Worker is gone; fall back to the caller.
                        metrics::record_callback_panics(delivery.deliver());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::domain::market::{Candle, Indicator, Interval, Quote, StudyKey, StudyParams};
    use crate::infrastructure::tradingview::commands::CommandPlanner;
    use crate::infrastructure::tradingview::messages::StudyRow;

    fn planner() -> CommandPlanner {
        CommandPlanner::new(vec!["lp".to_string()], 100)
    }

    fn online() -> StreamState {
        let mut state = StreamState::new(10);
        state.link = Some(1);
        state
    }

    fn chart() -> ChartKey {
        ChartKey::new("ABC", Interval::OneMinute)
    }

    fn quote(state: &StreamState, name: &str, fields: serde_json::Value) -> ServerMessage {
        let serde_json::Value::Object(fields) = fields else {
            panic!("fields must be an object");
        };
        ServerMessage::Quote {
            session: state.sessions.quote_session().unwrap().to_string(),
            data: QuoteData {
                name: name.to_string(),
                status: QuoteStatus::Ok,
                fields,
            },
        }
    }

    fn bar(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
            volume: 10.0,
        }
    }

    fn series(session: &str, bars: Vec<Candle>) -> ServerMessage {
        ServerMessage::Series(SeriesData {
            session: session.to_string(),
            bars,
            studies: Vec::new(),
        })
    }

    fn deliver_all(dispatched: Dispatched) {
        for delivery in dispatched.deliveries {
            assert_eq!(delivery.deliver(), 0);
        }
    }

    #[test]
    fn quote_updates_cache_last_write_wins() {
        let mut state = online();
        let _ = planner().subscribe_quote(&mut state, "ABC", "BIST:ABC");
        assert!(state.cache.get_quote("ABC").is_none());

        let message = quote(&state, "BIST:ABC", json!({"lp": 100.5, "volume": 500}));
        deliver_all(dispatch(&mut state, message));
        let cached = state.cache.get_quote("ABC").unwrap();
        assert_eq!(cached.last(), Some(100.5));
        assert_eq!(cached.volume(), Some(500.0));

        let message = quote(&state, "BIST:ABC", json!({"lp": 101.0}));
        deliver_all(dispatch(&mut state, message));
        let cached = state.cache.get_quote("ABC").unwrap();
        assert_eq!(cached.last(), Some(101.0));
        assert_eq!(cached.volume(), Some(500.0));
        assert_eq!(
            state.subscriptions.quote("ABC").unwrap().state,
            SubscriptionState::Active
        );
    }

    #[test]
    fn quote_error_fails_subscription_without_caching() {
        let mut state = online();
        let _ = planner().subscribe_quote(&mut state, "NOPE", "BIST:NOPE");
        let session = state.sessions.quote_session().unwrap().to_string();

        let dispatched = dispatch(
            &mut state,
            ServerMessage::Quote {
                session,
                data: QuoteData {
                    name: "BIST:NOPE".into(),
                    status: QuoteStatus::Error,
                    fields: serde_json::Map::new(),
                },
            },
        );
        assert!(dispatched.deliveries.is_empty());
        assert!(state.cache.get_quote("NOPE").is_none());
        assert_eq!(
            state.subscriptions.quote("NOPE").unwrap().state,
            SubscriptionState::Failed
        );
    }

    #[test]
    fn quote_wakes_waiters_and_handlers_of_its_symbol_only() {
        let mut state = online();
        let _ = planner().subscribe_quote(&mut state, "ABC", "BIST:ABC");
        let _ = planner().subscribe_quote(&mut state, "DEF", "BIST:DEF");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        state.callbacks.add_quote(
            Some("ABC".into()),
            Arc::new(move |quote: &Quote| sink.lock().unwrap().push(quote.symbol.clone())),
        );
        let mut abc = state.quote_waiters.register("ABC".into());

        let message = quote(&state, "BIST:DEF", json!({"lp": 1}));
        deliver_all(dispatch(&mut state, message));
        assert!(abc.try_recv().is_err());

        let message = quote(&state, "BIST:ABC", json!({"lp": 2}));
        deliver_all(dispatch(&mut state, message));
        assert_eq!(abc.try_recv().unwrap().last(), Some(2.0));
        assert_eq!(*seen.lock().unwrap(), vec!["ABC".to_string()]);
    }

    #[test]
    fn quote_reaches_every_alias_of_its_exchange_symbol() {
        let mut state = online();
        let _ = planner().subscribe_quote(&mut state, "ABC", "BIST:ABC");
        let _ = planner().subscribe_quote(&mut state, "BIST:ABC", "BIST:ABC");
        let mut short = state.quote_waiters.register("ABC".into());
        let mut qualified = state.quote_waiters.register("BIST:ABC".into());

        let message = quote(&state, "BIST:ABC", json!({"lp": 7}));
        let dispatched = dispatch(&mut state, message);
        assert_eq!(dispatched.deliveries.len(), 2);
        deliver_all(dispatched);

        assert_eq!(short.try_recv().unwrap().symbol, "ABC");
        assert_eq!(qualified.try_recv().unwrap().symbol, "BIST:ABC");
        assert_eq!(state.cache.get_quote("ABC").unwrap().last(), Some(7.0));
        assert_eq!(state.cache.get_quote("BIST:ABC").unwrap().last(), Some(7.0));
    }

    #[test]
    fn quotes_for_unknown_sessions_are_ignored() {
        let mut state = online();
        let _ = planner().subscribe_quote(&mut state, "ABC", "BIST:ABC");
        let dispatched = dispatch(
            &mut state,
            ServerMessage::Quote {
                session: "qs_other".into(),
                data: QuoteData {
                    name: "BIST:ABC".into(),
                    status: QuoteStatus::Ok,
                    fields: serde_json::Map::new(),
                },
            },
        );
        assert!(dispatched.deliveries.is_empty());
        assert!(state.cache.get_quote("ABC").is_none());
    }

    #[test]
    fn same_timestamp_bar_replaces_the_last_one() {
        let mut state = online();
        let _ = planner().subscribe_chart(&mut state, &chart(), "BIST:ABC");
        let session = state.sessions.chart_session(&chart()).unwrap().to_string();

        deliver_all(dispatch(&mut state, series(&session, vec![bar(60, 1.0)])));
        deliver_all(dispatch(&mut state, series(&session, vec![bar(60, 1.7)])));

        let candles = state.cache.get_candles(&chart(), None);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 1.7);
        assert_eq!(
            state.subscriptions.chart(&chart()).unwrap().state,
            SubscriptionState::Active
        );
    }

    #[test]
    fn history_batch_delivers_newest_bar_once() {
        let mut state = online();
        let _ = planner().subscribe_chart(&mut state, &chart(), "BIST:ABC");
        let session = state.sessions.chart_session(&chart()).unwrap().to_string();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        state.callbacks.add_candle(
            None,
            Arc::new(move |_key: &ChartKey, candle: &Candle| sink.lock().unwrap().push(candle.time)),
        );

        let dispatched = dispatch(&mut state, series(&session, vec![bar(60, 1.0), bar(120, 2.0), bar(180, 3.0)]));
        assert_eq!(dispatched.deliveries.len(), 1);
        deliver_all(dispatched);
        assert_eq!(*calls.lock().unwrap(), vec![180]);

        // An older bar changes nothing and notifies no one.
        let dispatched = dispatch(&mut state, series(&session, vec![bar(60, 9.0)]));
        assert!(dispatched.deliveries.is_empty());
    }

    #[test]
    fn chart_ack_releases_queued_studies() {
        let planner = planner();
        let mut state = online();
        let _ = planner.subscribe_chart(&mut state, &chart(), "BIST:ABC");
        let first = state.sessions.chart_session(&chart()).unwrap().to_string();
        let _ = dispatch(&mut state, ServerMessage::Ack(Ack::SymbolResolved { session: first }));
        let rsi = StudyKey::new("ABC", Interval::OneMinute, "RSI");
        let _ = planner
            .add_study(&mut state, &rsi, Indicator::resolve("RSI"), StudyParams::new())
            .unwrap();

        // Reconnect: chart stays Active, its new session is pending.
        let _ = planner.handshake(&mut state, "token");
        let session = state.sessions.chart_session(&chart()).unwrap().to_string();

        let dispatched = dispatch(
            &mut state,
            ServerMessage::Ack(Ack::SeriesCompleted { session: session.clone() }),
        );
        assert_eq!(dispatched.commands.len(), 1);
        assert_eq!(dispatched.commands[0].method, "create_study");
        assert_eq!(dispatched.commands[0].param_str(0), Some(session.as_str()));

        let again = dispatch(&mut state, ServerMessage::Ack(Ack::SymbolResolved { session }));
        assert!(again.commands.is_empty());
    }

    #[test]
    fn study_rows_are_mapped_cached_and_delivered() {
        let planner = planner();
        let mut state = online();
        let _ = planner.subscribe_chart(&mut state, &chart(), "BIST:ABC");
        let session = state.sessions.chart_session(&chart()).unwrap().to_string();
        let _ = dispatch(&mut state, ServerMessage::Ack(Ack::SymbolResolved { session: session.clone() }));
        let macd = StudyKey::new("ABC", Interval::OneMinute, "MACD");
        let commands = planner
            .add_study(&mut state, &macd, Indicator::resolve("MACD"), StudyParams::new())
            .unwrap();
        let study_id = commands[0].param_str(1).unwrap().to_string();
        let mut waiter = state.study_waiters.register(macd.clone());

        let dispatched = dispatch(
            &mut state,
            ServerMessage::Series(SeriesData {
                session,
                bars: Vec::new(),
                studies: vec![StudyRow {
                    study_id,
                    row: vec![json!(120), json!(1.5), json!(1.0), json!(0.5)],
                }],
            }),
        );
        deliver_all(dispatched);

        let values = waiter.try_recv().unwrap();
        assert_eq!(values.get("macd"), Some(1.5));
        assert_eq!(values.get("histogram"), Some(0.5));
        assert_eq!(state.cache.get_study(&macd), Some(values));
        assert_eq!(
            state.subscriptions.study(&macd).unwrap().state,
            SubscriptionState::Active
        );
    }

    #[test]
    fn errors_fail_their_subscription() {
        let planner = planner();
        let mut state = online();
        let _ = planner.subscribe_chart(&mut state, &chart(), "BIST:ABC");
        let session = state.sessions.chart_session(&chart()).unwrap().to_string();

        let dispatched = dispatch(
            &mut state,
            ServerMessage::Error(ServerError::Symbol {
                session: session.clone(),
                detail: "invalid symbol".into(),
            }),
        );
        assert!(dispatched.fault.is_none());
        assert_eq!(
            state.subscriptions.chart(&chart()).unwrap().state,
            SubscriptionState::Failed
        );

        // Late data does not revive a failed chart.
        let _ = dispatch(&mut state, series(&session, vec![bar(60, 1.0)]));
        assert_eq!(
            state.subscriptions.chart(&chart()).unwrap().state,
            SubscriptionState::Failed
        );
    }

    #[test]
    fn critical_errors_are_faults() {
        let mut state = online();
        let dispatched = dispatch(
            &mut state,
            ServerMessage::Error(ServerError::Critical { detail: "bye".into() }),
        );
        assert_eq!(dispatched.fault.as_deref(), Some("bye"));
        assert!(dispatch(&mut state, ServerMessage::Unknown("notify".into())).deliveries.is_empty());
    }

    #[tokio::test]
    async fn worker_mode_preserves_order_and_isolates_panics() {
        let (deliverer, handle) = Deliverer::spawn(DispatchMode::Worker(4));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut deliveries = Vec::new();
        for i in 0..10 {
            let sink = Arc::clone(&seen);
            let handlers: Vec<crate::application::services::QuoteHandler> = vec![
                Arc::new(|_quote: &Quote| panic!("boom")),
                Arc::new(move |quote: &Quote| sink.lock().unwrap().push(quote.symbol.clone())),
            ];
            deliveries.push(Delivery::Quote {
                quote: Quote::new(format!("S{i}"), format!("BIST:S{i}")),
                handlers,
                waiters: Vec::new(),
            });
        }
        deliverer.deliver(deliveries).await;
        drop(deliverer);
        handle.unwrap().await.unwrap();

        let expected: Vec<String> = (0..10).map(|i| format!("S{i}")).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }
}
