//! Session Registry
//!
//! Client-generated session identifiers for one connection: a single quote
//! session shared by every quote subscription, and one chart session per
//! chart subscription. Each chart session carries one price series and the
//! studies attached to it.
//!
//! The registry is an index only. It maps session ids to subscription keys;
//! the subscription table maps keys back to session ids. Nothing is owned
//! across the two.
//!
//! Sessions are `Pending` until the service acknowledges them. Studies
//! attached to a pending chart session are queued and handed back by
//! [`SessionRegistry::activate_chart`].
//!
//! Everything here is scoped to one connection: [`SessionRegistry::reset`]
//! runs before each handshake and identifiers restart.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use rand::Rng;

use super::market::{ChartKey, StudyKey, Symbol};

/// Prefix of quote session ids.
pub const QUOTE_SESSION_PREFIX: &str = "qs";

/// Prefix of chart session ids.
pub const CHART_SESSION_PREFIX: &str = "cs";

const SESSION_ID_LEN: usize = 12;
const SESSION_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

// =============================================================================
// Identifiers
// =============================================================================

/// A session identifier (`qs_xxxxxxxxxxxx`, `cs_xxxxxxxxxxxx`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a random identifier with the given prefix.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        let mut rng = rand::rng();
        let suffix: String = (0..SESSION_ID_LEN)
            .map(|_| char::from(SESSION_ID_CHARSET[rng.random_range(0..SESSION_ID_CHARSET.len())]))
            .collect();
        Self(format!("{prefix}_{suffix}"))
    }

    /// The identifier as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Acknowledgement state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Created on our side, not yet acknowledged.
    #[default]
    Pending,
    /// Acknowledged by the service.
    Active,
}

// =============================================================================
// Sessions
// =============================================================================

#[derive(Debug)]
struct QuoteSession {
    id: SessionId,
    state: SessionState,
    symbols: BTreeSet<Symbol>,
}

#[derive(Debug)]
struct ChartSession {
    key: ChartKey,
    series_id: String,
    state: SessionState,
    /// Study id to study key.
    studies: HashMap<String, StudyKey>,
    /// Studies waiting for the session to become active.
    queued: Vec<StudyKey>,
}

/// A chart session created by [`SessionRegistry::ensure_chart_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChartSession {
    /// Chart session id.
    pub session: SessionId,
    /// Series id used for symbol resolution (`ser_N`).
    pub series_id: String,
    /// Exchange-qualified symbol to resolve.
    pub exchange_symbol: String,
}

/// Outcome of [`SessionRegistry::attach_study`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudyAttach {
    /// The chart session is active: send `create_study` now.
    Send {
        /// Chart session id.
        session: SessionId,
        /// Allocated study id (`stN`).
        study_id: String,
    },
    /// The chart session is pending: the study is flushed on activation.
    Queued,
}

/// A queued study released by [`SessionRegistry::activate_chart`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedStudy {
    /// Study key.
    pub key: StudyKey,
    /// Allocated study id.
    pub study_id: String,
}

// =============================================================================
// Session Registry
// =============================================================================

/// Session index for one connection.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    quote: Option<QuoteSession>,
    charts: HashMap<SessionId, ChartSession>,
    by_chart: HashMap<ChartKey, SessionId>,
    next_series: u64,
    next_study: u64,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every session. Called before each handshake.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    // -------------------------------------------------------------------------
    // Quote session
    // -------------------------------------------------------------------------

    /// The shared quote session, created on first call.
    ///
    /// Returns the id and whether it was just created (in which case the
    /// caller sends `quote_create_session` and `quote_set_fields`).
    pub fn ensure_quote_session(&mut self) -> (SessionId, bool) {
        if let Some(session) = &self.quote {
            return (session.id.clone(), false);
        }
        let id = SessionId::generate(QUOTE_SESSION_PREFIX);
        self.quote = Some(QuoteSession {
            id: id.clone(),
            state: SessionState::Pending,
            symbols: BTreeSet::new(),
        });
        (id, true)
    }

    /// The quote session, if one exists on this connection.
    #[must_use]
    pub fn quote_session(&self) -> Option<&SessionId> {
        self.quote.as_ref().map(|session| &session.id)
    }

    /// Whether `id` is this connection's quote session.
    #[must_use]
    pub fn is_quote_session(&self, id: &str) -> bool {
        self.quote
            .as_ref()
            .is_some_and(|session| session.id.as_str() == id)
    }

    /// Mark the quote session acknowledged.
    pub fn activate_quote_session(&mut self) {
        if let Some(session) = self.quote.as_mut() {
            session.state = SessionState::Active;
        }
    }

    /// Index a symbol under the quote session.
    pub fn add_quote_symbol(&mut self, symbol: &str) {
        if let Some(session) = self.quote.as_mut() {
            session.symbols.insert(symbol.to_string());
        }
    }

    /// Remove a symbol from the quote session index.
    pub fn remove_quote_symbol(&mut self, symbol: &str) -> bool {
        self.quote
            .as_mut()
            .is_some_and(|session| session.symbols.remove(symbol))
    }

    /// State of the quote session.
    #[must_use]
    pub fn quote_session_state(&self) -> Option<SessionState> {
        self.quote.as_ref().map(|session| session.state)
    }

    // -------------------------------------------------------------------------
    // Chart sessions
    // -------------------------------------------------------------------------

    /// Create the chart session for `key` unless it already exists.
    ///
    /// Returns the new session (the caller sends `chart_create_session`,
    /// `resolve_symbol` and `create_series`), or `None` if one exists.
    pub fn ensure_chart_session(
        &mut self,
        key: &ChartKey,
        exchange_symbol: &str,
    ) -> Option<NewChartSession> {
        if self.by_chart.contains_key(key) {
            return None;
        }

        self.next_series += 1;
        let session = SessionId::generate(CHART_SESSION_PREFIX);
        let series_id = format!("ser_{}", self.next_series);

        self.by_chart.insert(key.clone(), session.clone());
        self.charts.insert(
            session.clone(),
            ChartSession {
                key: key.clone(),
                series_id: series_id.clone(),
                state: SessionState::Pending,
                studies: HashMap::new(),
                queued: Vec::new(),
            },
        );

        Some(NewChartSession {
            session,
            series_id,
            exchange_symbol: exchange_symbol.to_string(),
        })
    }

    /// Mark a chart session acknowledged and release its queued studies.
    ///
    /// Returns nothing when the session is unknown or already active.
    pub fn activate_chart(&mut self, session: &str) -> Vec<ReleasedStudy> {
        let Some(chart) = self.charts.get_mut(&SessionId::from(session)) else {
            return Vec::new();
        };
        if chart.state == SessionState::Active {
            return Vec::new();
        }
        chart.state = SessionState::Active;

        let queued = std::mem::take(&mut chart.queued);
        queued
            .into_iter()
            .map(|key| {
                self.next_study += 1;
                let study_id = format!("st{}", self.next_study);
                chart.studies.insert(study_id.clone(), key.clone());
                ReleasedStudy { key, study_id }
            })
            .collect()
    }

    /// Drop a chart session and its studies. Returns the session id.
    pub fn remove_chart_session(&mut self, key: &ChartKey) -> Option<SessionId> {
        let session = self.by_chart.remove(key)?;
        self.charts.remove(&session);
        Some(session)
    }

    /// Session serving a chart.
    #[must_use]
    pub fn chart_session(&self, key: &ChartKey) -> Option<&SessionId> {
        self.by_chart.get(key)
    }

    /// Chart served by a session.
    #[must_use]
    pub fn chart_for(&self, session: &str) -> Option<&ChartKey> {
        self.charts
            .get(&SessionId::from(session))
            .map(|chart| &chart.key)
    }

    /// State of a chart session.
    #[must_use]
    pub fn chart_state(&self, key: &ChartKey) -> Option<SessionState> {
        self.by_chart
            .get(key)
            .and_then(|session| self.charts.get(session))
            .map(|chart| chart.state)
    }

    /// Series id of a chart session.
    #[must_use]
    pub fn series_id(&self, key: &ChartKey) -> Option<&str> {
        self.by_chart
            .get(key)
            .and_then(|session| self.charts.get(session))
            .map(|chart| chart.series_id.as_str())
    }

    // -------------------------------------------------------------------------
    // Studies
    // -------------------------------------------------------------------------

    /// Attach a study to its chart session.
    ///
    /// Returns `None` when the chart has no session on this connection. A
    /// study that was attached before gets a fresh id.
    pub fn attach_study(&mut self, key: &StudyKey) -> Option<StudyAttach> {
        let session = self.by_chart.get(&key.chart())?.clone();
        let chart = self.charts.get_mut(&session)?;

        chart.studies.retain(|_, attached| attached != key);
        chart.queued.retain(|queued| queued != key);

        if chart.state == SessionState::Pending {
            chart.queued.push(key.clone());
            return Some(StudyAttach::Queued);
        }

        self.next_study += 1;
        let study_id = format!("st{}", self.next_study);
        chart.studies.insert(study_id.clone(), key.clone());
        Some(StudyAttach::Send { session, study_id })
    }

    /// Detach a study.
    ///
    /// Returns the session and study id if a `remove_study` must be sent;
    /// a study that was still queued is dropped silently.
    pub fn detach_study(&mut self, key: &StudyKey) -> Option<(SessionId, String)> {
        let session = self.by_chart.get(&key.chart())?.clone();
        let chart = self.charts.get_mut(&session)?;

        chart.queued.retain(|queued| queued != key);
        let study_id = chart
            .studies
            .iter()
            .find(|(_, attached)| *attached == key)
            .map(|(id, _)| id.clone())?;
        chart.studies.remove(&study_id);
        Some((session, study_id))
    }

    /// Study served by `study_id` on a chart session.
    #[must_use]
    pub fn study_for(&self, session: &str, study_id: &str) -> Option<&StudyKey> {
        self.charts
            .get(&SessionId::from(session))
            .and_then(|chart| chart.studies.get(study_id))
    }

    /// Number of chart sessions on this connection.
    #[must_use]
    pub fn chart_session_count(&self) -> usize {
        self.charts.len()
    }
}
