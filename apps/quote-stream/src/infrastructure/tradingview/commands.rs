//! Command Planning
//!
//! Turns subscription table transitions into outbound commands. Every
//! method mutates [`StreamState`] and returns the messages to write, so the
//! caller can hand them to the writer after releasing the lock.
//!
//! While no connection is live (`state.link` is `None`) the table is still
//! updated but nothing is returned; the next handshake replays it.

use std::collections::BTreeSet;

use crate::application::services::StreamState;
use crate::domain::market::{ChartKey, Indicator, StudyKey, StudyParams};
use crate::domain::session::{ReleasedStudy, StudyAttach};
use crate::domain::subscription::SubscriptionError;

use super::codec::Message;
use super::messages;

/// Builds outbound commands for subscription changes.
#[derive(Debug, Clone)]
pub struct CommandPlanner {
    quote_fields: Vec<String>,
    bar_count: u32,
}

impl CommandPlanner {
    /// Planner requesting `quote_fields` on the quote session and
    /// `bar_count` bars per chart series.
    #[must_use]
    pub const fn new(quote_fields: Vec<String>, bar_count: u32) -> Self {
        Self {
            quote_fields,
            bar_count,
        }
    }

    /// Commands for the handshake of a fresh connection: auth, then the
    /// replay of every subscription that has not failed.
    ///
    /// Session ids of the previous connection are discarded first. Studies
    /// are queued on their pending chart sessions and released by the
    /// dispatcher once the chart is acknowledged.
    pub fn handshake(&self, state: &mut StreamState, auth_token: &str) -> Vec<Message> {
        state.sessions.reset();
        state.subscriptions.detach_sessions();

        let mut commands = vec![messages::set_auth_token(auth_token)];
        let replay = state.subscriptions.active_subscriptions();

        if !replay.quotes.is_empty() {
            let (session, _) = state.sessions.ensure_quote_session();
            commands.push(messages::quote_create_session(session.as_str()));
            commands.push(messages::quote_set_fields(session.as_str(), &self.quote_fields));

            for quote in &replay.quotes {
                state.sessions.add_quote_symbol(&quote.symbol);
                state.subscriptions.attach_quote_session(&quote.symbol, &session);
            }
            let symbols: Vec<&str> = replay
                .quotes
                .iter()
                .map(|quote| quote.exchange_symbol.as_str())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            commands.push(messages::quote_add_symbols(session.as_str(), &symbols));
        }

        for chart in &replay.charts {
            commands.extend(self.open_chart(state, &chart.key, &chart.exchange_symbol));
        }

        for study in &replay.studies {
            // Chart sessions are pending, so this only queues.
            let _ = state.sessions.attach_study(&study.key);
        }

        tracing::debug!(
            quotes = replay.quotes.len(),
            charts = replay.charts.len(),
            studies = replay.studies.len(),
            "planned subscription replay"
        );
        commands
    }

    // -------------------------------------------------------------------------
    // Quotes
    // -------------------------------------------------------------------------

    /// Subscribe to quotes for a normalized symbol.
    ///
    /// A symbol whose exchange symbol is already subscribed under another
    /// alias joins that feed: it inherits the cached quote and sends
    /// nothing.
    pub fn subscribe_quote(
        &self,
        state: &mut StreamState,
        symbol: &str,
        exchange_symbol: &str,
    ) -> Vec<Message> {
        let known = state.subscriptions.quote(symbol).is_some();
        let needs_command = state.subscriptions.subscribe_quote(symbol, exchange_symbol);
        if !needs_command && !known {
            join_feed(state, symbol);
        }
        if !needs_command || state.link.is_none() {
            return Vec::new();
        }

        let mut commands = Vec::with_capacity(3);
        let (session, created) = state.sessions.ensure_quote_session();
        if created {
            commands.push(messages::quote_create_session(session.as_str()));
            commands.push(messages::quote_set_fields(session.as_str(), &self.quote_fields));
        }
        state.sessions.add_quote_symbol(symbol);
        state.subscriptions.attach_quote_session(symbol, &session);

        let exchange_symbol = state
            .subscriptions
            .quote(symbol)
            .map_or(exchange_symbol, |sub| sub.exchange_symbol.as_str());
        commands.push(messages::quote_add_symbols(session.as_str(), &[exchange_symbol]));
        commands
    }

    /// Drop a quote subscription with its cached quote and exact-key
    /// handlers.
    ///
    /// `quote_remove_symbols` is only sent when no other alias still uses
    /// the exchange symbol.
    pub fn unsubscribe_quote(&self, state: &mut StreamState, symbol: &str) -> Vec<Message> {
        let Some(removed) = state.subscriptions.unsubscribe_quote(symbol) else {
            return Vec::new();
        };
        state.cache.remove_quote(symbol);
        state.callbacks.remove_quote_handlers(symbol);

        let indexed = state.sessions.remove_quote_symbol(symbol);
        let shared = !state.subscriptions.aliases(&removed.exchange_symbol).is_empty();
        if state.link.is_none() || !indexed || shared {
            return Vec::new();
        }
        state
            .sessions
            .quote_session()
            .map(|session| {
                vec![messages::quote_remove_symbols(
                    session.as_str(),
                    &[removed.exchange_symbol.as_str()],
                )]
            })
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Charts
    // -------------------------------------------------------------------------

    /// Subscribe to candles for a chart.
    pub fn subscribe_chart(
        &self,
        state: &mut StreamState,
        key: &ChartKey,
        exchange_symbol: &str,
    ) -> Vec<Message> {
        if !state.subscriptions.subscribe_chart(key, exchange_symbol) {
            return Vec::new();
        }
        if state.link.is_none() {
            return Vec::new();
        }

        let mut commands = Vec::new();
        // A failed chart being retried still has its old session.
        if let Some(stale) = state.sessions.remove_chart_session(key) {
            commands.push(messages::chart_delete_session(stale.as_str()));
        }
        let exchange_symbol = state
            .subscriptions
            .chart(key)
            .map_or_else(|| exchange_symbol.to_string(), |sub| sub.exchange_symbol.clone());
        commands.extend(self.open_chart(state, key, &exchange_symbol));
        commands
    }

    /// Drop a chart subscription, its studies, their cached data and
    /// exact-key handlers, and delete the chart session.
    pub fn unsubscribe_chart(&self, state: &mut StreamState, key: &ChartKey) -> Vec<Message> {
        let Some((_, studies)) = state.subscriptions.unsubscribe_chart(key) else {
            return Vec::new();
        };
        state.cache.remove_chart(key);
        state.callbacks.remove_chart_handlers(key);
        tracing::debug!(chart = %key, studies = studies.len(), "chart unsubscribed");

        match state.sessions.remove_chart_session(key) {
            Some(session) if state.link.is_some() => {
                vec![messages::chart_delete_session(session.as_str())]
            }
            _ => Vec::new(),
        }
    }

    fn open_chart(
        &self,
        state: &mut StreamState,
        key: &ChartKey,
        exchange_symbol: &str,
    ) -> Vec<Message> {
        let Some(new) = state.sessions.ensure_chart_session(key, exchange_symbol) else {
            return Vec::new();
        };
        state.subscriptions.attach_chart_session(key, &new.session);

        let session = new.session.as_str();
        vec![
            messages::chart_create_session(session),
            messages::resolve_symbol(session, &new.series_id, &new.exchange_symbol),
            messages::create_series(session, &new.series_id, key.interval.timeframe(), self.bar_count),
        ]
    }

    // -------------------------------------------------------------------------
    // Studies
    // -------------------------------------------------------------------------

    /// Add a study on top of an active chart.
    ///
    /// # Errors
    ///
    /// Propagates [`SubscriptionError::ChartNotActive`] and
    /// [`SubscriptionError::StudyConflict`]; nothing is sent in that case.
    pub fn add_study(
        &self,
        state: &mut StreamState,
        key: &StudyKey,
        indicator: Indicator,
        params: StudyParams,
    ) -> Result<Vec<Message>, SubscriptionError> {
        if !state.subscriptions.add_study(key, indicator, params)? {
            return Ok(Vec::new());
        }
        if state.link.is_none() {
            return Ok(Vec::new());
        }

        match state.sessions.attach_study(key) {
            Some(StudyAttach::Send { session, study_id }) => Ok(state
                .subscriptions
                .study(key)
                .map(|sub| {
                    vec![messages::create_study(
                        session.as_str(),
                        &study_id,
                        &sub.indicator,
                        &sub.params,
                    )]
                })
                .unwrap_or_default()),
            Some(StudyAttach::Queued) | None => Ok(Vec::new()),
        }
    }

    /// Remove a study with its cached output and exact-key handlers.
    pub fn remove_study(&self, state: &mut StreamState, key: &StudyKey) -> Vec<Message> {
        if state.subscriptions.remove_study(key).is_none() {
            return Vec::new();
        }
        state.cache.remove_study(key);
        state.callbacks.remove_study_handlers(key);

        match state.sessions.detach_study(key) {
            Some((session, study_id)) if state.link.is_some() => {
                vec![messages::remove_study(session.as_str(), &study_id)]
            }
            _ => Vec::new(),
        }
    }
}

/// `create_study` commands for studies released by a chart acknowledgement.
///
/// Studies unsubscribed while they were queued are skipped.
#[must_use]
pub fn study_commands(state: &StreamState, released: &[ReleasedStudy]) -> Vec<Message> {
    released
        .iter()
        .filter_map(|study| {
            let sub = state.subscriptions.study(&study.key)?;
            let session = state.sessions.chart_session(&study.key.chart())?;
            Some(messages::create_study(
                session.as_str(),
                &study.study_id,
                &sub.indicator,
                &sub.params,
            ))
        })
        .collect()
}

/// Hook a new alias onto a feed another symbol already holds.
fn join_feed(state: &mut StreamState, symbol: &str) {
    let Some(sub) = state.subscriptions.quote(symbol).cloned() else {
        return;
    };
    if let Some(session) = &sub.session {
        state.sessions.add_quote_symbol(symbol);
        state.subscriptions.attach_quote_session(symbol, session);
    }
    let source = state
        .subscriptions
        .aliases(&sub.exchange_symbol)
        .into_iter()
        .find(|alias| alias != symbol);
    if let Some(source) = source {
        state.cache.copy_quote(&source, symbol);
    }
}
