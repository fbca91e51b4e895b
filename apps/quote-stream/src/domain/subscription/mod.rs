//! Subscription Table
//!
//! Tracks what the consumer asked for, independently of any connection:
//! quotes keyed by symbol, charts keyed by (symbol, interval) and studies
//! keyed by (symbol, interval, name).
//!
//! # Design
//!
//! - Every subscribe is idempotent: the return value says whether the call
//!   created (or revived a failed) subscription, i.e. whether an outbound
//!   command is needed
//! - Subscriptions reference sessions by id only; the session registry owns
//!   the reverse index
//! - `Active` survives reconnects, `Failed` entries are never replayed
//! - A study can only be added on top of an `Active` chart
//! - Quote symbols that resolve to the same exchange symbol are aliases of
//!   one feed: the first subscribes it, the last removal releases it

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::market::{ChartKey, Indicator, StudyKey, StudyParams, Symbol};
use super::session::SessionId;

// =============================================================================
// Errors
// =============================================================================

/// Rejected subscription requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Symbol is empty or malformed.
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// Interval is not supported.
    #[error("invalid interval: {0:?}")]
    InvalidInterval(String),

    /// The symbol resolver could not map the ticker.
    #[error("cannot resolve symbol {symbol}: {reason}")]
    Unresolved {
        /// Ticker as given.
        symbol: String,
        /// Resolver message.
        reason: String,
    },

    /// Study requested without an active chart subscription.
    #[error("chart {0} is not active; subscribe_chart first and wait for data")]
    ChartNotActive(ChartKey),

    /// Study already exists with different inputs.
    #[error("study {0} already exists with different inputs")]
    StudyConflict(StudyKey),

    /// Offline policy is `reject` and the client is not connected.
    #[error("not connected")]
    NotConnected,
}

// =============================================================================
// Subscription Records
// =============================================================================

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    /// Requested, not yet confirmed by data.
    #[default]
    Pending,
    /// Confirmed by the service.
    Active,
    /// Rejected by the service.
    Failed,
}

impl SubscriptionState {
    /// Whether the subscription should be replayed after a reconnect.
    #[must_use]
    pub const fn is_replayable(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// A quote subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteSubscription {
    /// Normalized ticker.
    pub symbol: Symbol,
    /// Exchange-qualified id sent to the service.
    pub exchange_symbol: String,
    /// Lifecycle state.
    pub state: SubscriptionState,
    /// Quote session on the current connection.
    pub session: Option<SessionId>,
}

/// A chart subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartSubscription {
    /// Chart key.
    pub key: ChartKey,
    /// Exchange-qualified id sent to the service.
    pub exchange_symbol: String,
    /// Lifecycle state.
    pub state: SubscriptionState,
    /// Dedicated chart session on the current connection.
    pub session: Option<SessionId>,
}

/// A study subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct StudySubscription {
    /// Study key.
    pub key: StudyKey,
    /// Resolved indicator.
    pub indicator: Indicator,
    /// Consumer inputs.
    pub params: StudyParams,
    /// Lifecycle state.
    pub state: SubscriptionState,
}

/// Everything that should be recreated on a fresh connection.
#[derive(Debug, Clone, Default)]
pub struct ActiveSubscriptions {
    /// Replayable quotes.
    pub quotes: Vec<QuoteSubscription>,
    /// Replayable charts.
    pub charts: Vec<ChartSubscription>,
    /// Replayable studies whose chart is replayable too.
    pub studies: Vec<StudySubscription>,
}

impl ActiveSubscriptions {
    /// Whether nothing needs replaying.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty() && self.charts.is_empty() && self.studies.is_empty()
    }
}

/// Subscription counts by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SubscriptionCounts {
    /// Quote subscriptions.
    pub quotes: usize,
    /// Chart subscriptions.
    pub charts: usize,
    /// Study subscriptions.
    pub studies: usize,
}

// =============================================================================
// Subscription Table
// =============================================================================

/// Desired subscriptions and their state.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    quotes: BTreeMap<Symbol, QuoteSubscription>,
    by_exchange_symbol: HashMap<String, BTreeSet<Symbol>>,
    charts: BTreeMap<ChartKey, ChartSubscription>,
    studies: BTreeMap<StudyKey, StudySubscription>,
}

impl SubscriptionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Quotes
    // -------------------------------------------------------------------------

    /// Add a quote subscription.
    ///
    /// Returns `true` when a command must be sent: the exchange symbol was
    /// not subscribed yet, or a failed subscription is being retried. A
    /// symbol that resolves to an exchange symbol another alias already
    /// holds joins that feed and takes over its state.
    pub fn subscribe_quote(&mut self, symbol: &str, exchange_symbol: &str) -> bool {
        if let Some(existing) = self.quotes.get(symbol) {
            if existing.state != SubscriptionState::Failed {
                return false;
            }
            let exchange_symbol = existing.exchange_symbol.clone();
            self.set_feed_state(&exchange_symbol, SubscriptionState::Pending);
            return true;
        }

        let sibling = self
            .by_exchange_symbol
            .get(exchange_symbol)
            .and_then(|aliases| aliases.first())
            .and_then(|alias| self.quotes.get(alias))
            .map(|sub| (sub.state, sub.session.clone()));
        let (state, session, needs_command) = match sibling {
            Some((SubscriptionState::Failed, _)) => {
                self.set_feed_state(exchange_symbol, SubscriptionState::Pending);
                (SubscriptionState::Pending, None, true)
            }
            Some((state, session)) => (state, session, false),
            None => (SubscriptionState::Pending, None, true),
        };

        self.by_exchange_symbol
            .entry(exchange_symbol.to_string())
            .or_default()
            .insert(symbol.to_string());
        self.quotes.insert(
            symbol.to_string(),
            QuoteSubscription {
                symbol: symbol.to_string(),
                exchange_symbol: exchange_symbol.to_string(),
                state,
                session,
            },
        );
        needs_command
    }

    /// Remove a quote subscription.
    ///
    /// The exchange symbol stays subscribed while
    /// [`aliases`](Self::aliases) still lists another symbol for it.
    pub fn unsubscribe_quote(&mut self, symbol: &str) -> Option<QuoteSubscription> {
        let removed = self.quotes.remove(symbol)?;
        if let Some(aliases) = self.by_exchange_symbol.get_mut(&removed.exchange_symbol) {
            aliases.remove(symbol);
            if aliases.is_empty() {
                self.by_exchange_symbol.remove(&removed.exchange_symbol);
            }
        }
        Some(removed)
    }

    /// Look up a quote subscription.
    #[must_use]
    pub fn quote(&self, symbol: &str) -> Option<&QuoteSubscription> {
        self.quotes.get(symbol)
    }

    /// Every subscribed symbol fed by an exchange-qualified id reported by
    /// the service, sorted.
    #[must_use]
    pub fn aliases(&self, exchange_symbol: &str) -> Vec<Symbol> {
        self.by_exchange_symbol
            .get(exchange_symbol)
            .map(|aliases| aliases.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn set_feed_state(&mut self, exchange_symbol: &str, state: SubscriptionState) {
        for alias in self.aliases(exchange_symbol) {
            self.set_quote_state(&alias, state);
        }
    }

    /// Update a quote's state. Returns `true` if it changed.
    pub fn set_quote_state(&mut self, symbol: &str, state: SubscriptionState) -> bool {
        self.quotes
            .get_mut(symbol)
            .is_some_and(|sub| std::mem::replace(&mut sub.state, state) != state)
    }

    /// Record the quote session serving a symbol.
    pub fn attach_quote_session(&mut self, symbol: &str, session: &SessionId) {
        if let Some(sub) = self.quotes.get_mut(symbol) {
            sub.session = Some(session.clone());
        }
    }

    /// Subscribed quote symbols, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.quotes.keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Charts
    // -------------------------------------------------------------------------

    /// Add a chart subscription. Same return contract as
    /// [`subscribe_quote`](Self::subscribe_quote).
    pub fn subscribe_chart(&mut self, key: &ChartKey, exchange_symbol: &str) -> bool {
        if let Some(existing) = self.charts.get_mut(key) {
            if existing.state != SubscriptionState::Failed {
                return false;
            }
            existing.state = SubscriptionState::Pending;
            return true;
        }

        self.charts.insert(
            key.clone(),
            ChartSubscription {
                key: key.clone(),
                exchange_symbol: exchange_symbol.to_string(),
                state: SubscriptionState::Pending,
                session: None,
            },
        );
        true
    }

    /// Remove a chart subscription and every study attached to it.
    pub fn unsubscribe_chart(
        &mut self,
        key: &ChartKey,
    ) -> Option<(ChartSubscription, Vec<StudySubscription>)> {
        let chart = self.charts.remove(key)?;
        let study_keys: Vec<StudyKey> = self
            .studies
            .keys()
            .filter(|study| study.symbol == key.symbol && study.interval == key.interval)
            .cloned()
            .collect();
        let studies = study_keys
            .iter()
            .filter_map(|study| self.studies.remove(study))
            .collect();
        Some((chart, studies))
    }

    /// Look up a chart subscription.
    #[must_use]
    pub fn chart(&self, key: &ChartKey) -> Option<&ChartSubscription> {
        self.charts.get(key)
    }

    /// Update a chart's state. Returns `true` if it changed.
    pub fn set_chart_state(&mut self, key: &ChartKey, state: SubscriptionState) -> bool {
        self.charts
            .get_mut(key)
            .is_some_and(|sub| std::mem::replace(&mut sub.state, state) != state)
    }

    /// Record the chart session serving a chart.
    pub fn attach_chart_session(&mut self, key: &ChartKey, session: &SessionId) {
        if let Some(sub) = self.charts.get_mut(key) {
            sub.session = Some(session.clone());
        }
    }

    /// Subscribed charts, sorted.
    #[must_use]
    pub fn charts(&self) -> Vec<ChartKey> {
        self.charts.keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Studies
    // -------------------------------------------------------------------------

    /// Add a study on top of an active chart.
    ///
    /// Returns `Ok(true)` for a new study, `Ok(false)` if the same study
    /// already exists with the same inputs.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::ChartNotActive`] if the chart is missing or not
    ///   `Active`
    /// - [`SubscriptionError::StudyConflict`] if the study exists with other
    ///   inputs
    pub fn add_study(
        &mut self,
        key: &StudyKey,
        indicator: Indicator,
        params: StudyParams,
    ) -> Result<bool, SubscriptionError> {
        let chart = key.chart();
        let chart_active = self
            .charts
            .get(&chart)
            .is_some_and(|sub| sub.state == SubscriptionState::Active);
        if !chart_active {
            return Err(SubscriptionError::ChartNotActive(chart));
        }

        if let Some(existing) = self.studies.get_mut(key) {
            if existing.params != params || existing.indicator != indicator {
                return Err(SubscriptionError::StudyConflict(key.clone()));
            }
            if existing.state != SubscriptionState::Failed {
                return Ok(false);
            }
            existing.state = SubscriptionState::Pending;
            return Ok(true);
        }

        self.studies.insert(
            key.clone(),
            StudySubscription {
                key: key.clone(),
                indicator,
                params,
                state: SubscriptionState::Pending,
            },
        );
        Ok(true)
    }

    /// Remove a study.
    pub fn remove_study(&mut self, key: &StudyKey) -> Option<StudySubscription> {
        self.studies.remove(key)
    }

    /// Look up a study.
    #[must_use]
    pub fn study(&self, key: &StudyKey) -> Option<&StudySubscription> {
        self.studies.get(key)
    }

    /// Update a study's state. Returns `true` if it changed.
    pub fn set_study_state(&mut self, key: &StudyKey, state: SubscriptionState) -> bool {
        self.studies
            .get_mut(key)
            .is_some_and(|sub| std::mem::replace(&mut sub.state, state) != state)
    }

    // -------------------------------------------------------------------------
    // Replay
    // -------------------------------------------------------------------------

    /// Forget all session associations (the connection they lived on is gone).
    pub fn detach_sessions(&mut self) {
        for sub in self.quotes.values_mut() {
            sub.session = None;
        }
        for sub in self.charts.values_mut() {
            sub.session = None;
        }
    }

    /// Subscriptions to recreate on a new connection: every entry that has
    /// not failed, in key order.
    #[must_use]
    pub fn active_subscriptions(&self) -> ActiveSubscriptions {
        let quotes = self
            .quotes
            .values()
            .filter(|sub| sub.state.is_replayable())
            .cloned()
            .collect();
        let charts: Vec<ChartSubscription> = self
            .charts
            .values()
            .filter(|sub| sub.state.is_replayable())
            .cloned()
            .collect();
        let studies = self
            .studies
            .values()
            .filter(|sub| sub.state.is_replayable())
            .filter(|sub| charts.iter().any(|chart| chart.key == sub.key.chart()))
            .cloned()
            .collect();

        ActiveSubscriptions {
            quotes,
            charts,
            studies,
        }
    }

    /// Counts by kind.
    #[must_use]
    pub fn counts(&self) -> SubscriptionCounts {
        SubscriptionCounts {
            quotes: self.quotes.len(),
            charts: self.charts.len(),
            studies: self.studies.len(),
        }
    }
}
