//! Shared Stream State
//!
//! Subscription table, session registry, cache, callbacks and waiters
//! behind one lock. Consumer calls and the read loop both go through it,
//! which makes check-then-wait atomic with respect to dispatch: a waiter is
//! either registered before an update is applied (and gets woken) or sees
//! the update in the cache.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::cache::CacheStore;
use crate::domain::market::{Candle, ChartKey, Quote, StudyKey, StudyValues, Symbol};
use crate::domain::session::SessionRegistry;
use crate::domain::subscription::SubscriptionTable;

use super::callbacks::{CallbackRegistry, Waiters};

/// All mutable client state.
#[derive(Debug)]
pub struct StreamState {
    /// Desired subscriptions.
    pub subscriptions: SubscriptionTable,
    /// Sessions of the live connection.
    pub sessions: SessionRegistry,
    /// Latest values.
    pub cache: CacheStore,
    /// Consumer handlers.
    pub callbacks: CallbackRegistry,
    /// Pending `wait_for_quote` calls.
    pub quote_waiters: Waiters<Symbol, Quote>,
    /// Pending `wait_for_candle` calls.
    pub candle_waiters: Waiters<ChartKey, Candle>,
    /// Pending `wait_for_study` calls.
    pub study_waiters: Waiters<StudyKey, StudyValues>,
    /// Generation of the connection commands are routed to; `None` while
    /// no handshake has completed.
    pub link: Option<u64>,
    /// Set once by `disconnect`.
    pub closed: bool,
}

impl StreamState {
    /// Fresh state keeping `candle_capacity` bars per chart.
    #[must_use]
    pub fn new(candle_capacity: usize) -> Self {
        Self {
            subscriptions: SubscriptionTable::new(),
            sessions: SessionRegistry::new(),
            cache: CacheStore::new(candle_capacity),
            callbacks: CallbackRegistry::default(),
            quote_waiters: Waiters::default(),
            candle_waiters: Waiters::default(),
            study_waiters: Waiters::default(),
            link: None,
            closed: false,
        }
    }

    /// Drop every pending waiter; blocked `wait_for_*` calls return
    /// `Closed`.
    pub fn drop_waiters(&mut self) {
        self.quote_waiters.clear();
        self.candle_waiters.clear();
        self.study_waiters.clear();
    }
}

/// State shared between the client handle and its background tasks.
pub type SharedState = Arc<Mutex<StreamState>>;

/// Wrap fresh state for sharing.
#[must_use]
pub fn shared_state(candle_capacity: usize) -> SharedState {
    Arc::new(Mutex::new(StreamState::new(candle_capacity)))
}
