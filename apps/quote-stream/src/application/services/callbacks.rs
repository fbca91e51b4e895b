//! Callback Registry and Waiters
//!
//! Observers registered by the consumer, per exact key or wildcard, and the
//! one-shot waiters behind the `wait_for_*` calls.
//!
//! The dispatcher collects handlers and waiters while it holds the state
//! lock and hands them out as a [`Delivery`]; handlers always run after the
//! lock is released, so a handler may call back into the client.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::domain::market::{Candle, ChartKey, Quote, StudyKey, StudyValues, Symbol};

/// Handler for quote updates.
pub type QuoteHandler = Arc<dyn Fn(&Quote) + Send + Sync>;

/// Handler for candle updates; receives the newest bar after a merge.
pub type CandleHandler = Arc<dyn Fn(&ChartKey, &Candle) + Send + Sync>;

/// Handler for study updates.
pub type StudyHandler = Arc<dyn Fn(&StudyKey, &StudyValues) + Send + Sync>;

/// Identifies a registered callback for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

// =============================================================================
// Handler Lists
// =============================================================================

struct Registration<K, H> {
    id: CallbackId,
    /// `None` for wildcard handlers.
    key: Option<K>,
    handler: H,
}

struct HandlerList<K, H> {
    entries: Vec<Registration<K, H>>,
}

impl<K, H> Default for HandlerList<K, H> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K: PartialEq, H: Clone> HandlerList<K, H> {
    fn push(&mut self, id: CallbackId, key: Option<K>, handler: H) {
        self.entries.push(Registration { id, key, handler });
    }

    /// Exact-key handlers first, then wildcard handlers, each in
    /// registration order.
    fn matching(&self, key: &K) -> Vec<H> {
        let exact = self
            .entries
            .iter()
            .filter(|entry| entry.key.as_ref() == Some(key));
        let wildcard = self.entries.iter().filter(|entry| entry.key.is_none());
        exact.chain(wildcard).map(|entry| entry.handler.clone()).collect()
    }

    fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    fn remove_where(&mut self, predicate: impl Fn(&K) -> bool) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !entry.key.as_ref().is_some_and(&predicate));
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// =============================================================================
// Callback Registry
// =============================================================================

/// Registered quote, candle and study handlers.
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: u64,
    quotes: HandlerList<Symbol, QuoteHandler>,
    candles: HandlerList<ChartKey, CandleHandler>,
    studies: HandlerList<StudyKey, StudyHandler>,
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("quotes", &self.quotes.len())
            .field("candles", &self.candles.len())
            .field("studies", &self.studies.len())
            .finish()
    }
}

impl CallbackRegistry {
    fn allocate(&mut self) -> CallbackId {
        self.next_id += 1;
        CallbackId(self.next_id)
    }

    /// Register a quote handler; `None` means every symbol.
    pub fn add_quote(&mut self, symbol: Option<Symbol>, handler: QuoteHandler) -> CallbackId {
        let id = self.allocate();
        self.quotes.push(id, symbol, handler);
        id
    }

    /// Register a candle handler; `None` means every chart.
    pub fn add_candle(&mut self, key: Option<ChartKey>, handler: CandleHandler) -> CallbackId {
        let id = self.allocate();
        self.candles.push(id, key, handler);
        id
    }

    /// Register a study handler; `None` means every study.
    pub fn add_study(&mut self, key: Option<StudyKey>, handler: StudyHandler) -> CallbackId {
        let id = self.allocate();
        self.studies.push(id, key, handler);
        id
    }

    /// Unregister a handler. Returns `false` if the id is unknown.
    pub fn remove(&mut self, id: CallbackId) -> bool {
        self.quotes.remove(id) || self.candles.remove(id) || self.studies.remove(id)
    }

    /// Drop the exact-key quote handlers of a symbol.
    pub fn remove_quote_handlers(&mut self, symbol: &str) -> usize {
        self.quotes.remove_where(|key| key == symbol)
    }

    /// Drop the exact-key handlers of a chart and of its studies.
    pub fn remove_chart_handlers(&mut self, chart: &ChartKey) -> usize {
        self.candles.remove_where(|key| key == chart)
            + self
                .studies
                .remove_where(|key| key.symbol == chart.symbol && key.interval == chart.interval)
    }

    /// Drop the exact-key handlers of a study.
    pub fn remove_study_handlers(&mut self, study: &StudyKey) -> usize {
        self.studies.remove_where(|key| key == study)
    }

    /// Handlers to run for a quote update.
    #[must_use]
    pub fn quote_handlers(&self, symbol: &Symbol) -> Vec<QuoteHandler> {
        self.quotes.matching(symbol)
    }

    /// Handlers to run for a candle update.
    #[must_use]
    pub fn candle_handlers(&self, key: &ChartKey) -> Vec<CandleHandler> {
        self.candles.matching(key)
    }

    /// Handlers to run for a study update.
    #[must_use]
    pub fn study_handlers(&self, key: &StudyKey) -> Vec<StudyHandler> {
        self.studies.matching(key)
    }

    /// Total registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.quotes.len() + self.candles.len() + self.studies.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Waiters
// =============================================================================

/// Pending `wait_for_*` calls for one kind of data.
#[derive(Debug)]
pub struct Waiters<K, V> {
    pending: HashMap<K, Vec<oneshot::Sender<V>>>,
}

impl<K, V> Default for Waiters<K, V> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> Waiters<K, V> {
    /// Register a waiter for `key`. Waiters whose caller gave up are pruned.
    pub fn register(&mut self, key: K) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();
        let waiters = self.pending.entry(key).or_default();
        waiters.retain(|waiter| !waiter.is_closed());
        waiters.push(tx);
        rx
    }

    /// Remove and return every waiter for `key`.
    pub fn take(&mut self, key: &K) -> Vec<oneshot::Sender<V>> {
        self.pending.remove(key).unwrap_or_default()
    }

    /// Forget waiters for `key` whose caller gave up, and the key itself
    /// once none is left.
    pub fn prune(&mut self, key: &K) {
        if let Some(waiters) = self.pending.get_mut(key) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                self.pending.remove(key);
            }
        }
    }

    /// Whether any waiter, live or abandoned, is held for `key`.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of waiters still listening.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending
            .values()
            .flatten()
            .filter(|waiter| !waiter.is_closed())
            .count()
    }

    /// Whether no waiter is listening.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// One update ready to be handed to observers.
pub enum Delivery {
    /// Quote update.
    Quote {
        /// Snapshot after the merge.
        quote: Quote,
        /// Handlers in call order.
        handlers: Vec<QuoteHandler>,
        /// Waiters to wake.
        waiters: Vec<oneshot::Sender<Quote>>,
    },
    /// Candle update.
    Candle {
        /// Chart key.
        key: ChartKey,
        /// Newest bar after the merge.
        candle: Candle,
        /// Handlers in call order.
        handlers: Vec<CandleHandler>,
        /// Waiters to wake.
        waiters: Vec<oneshot::Sender<Candle>>,
    },
    /// Study update.
    Study {
        /// Study key.
        key: StudyKey,
        /// Latest output.
        values: StudyValues,
        /// Handlers in call order.
        handlers: Vec<StudyHandler>,
        /// Waiters to wake.
        waiters: Vec<oneshot::Sender<StudyValues>>,
    },
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quote { quote, handlers, .. } => f
                .debug_struct("Quote")
                .field("symbol", &quote.symbol)
                .field("handlers", &handlers.len())
                .finish_non_exhaustive(),
            Self::Candle { key, handlers, .. } => f
                .debug_struct("Candle")
                .field("key", key)
                .field("handlers", &handlers.len())
                .finish_non_exhaustive(),
            Self::Study { key, handlers, .. } => f
                .debug_struct("Study")
                .field("key", key)
                .field("handlers", &handlers.len())
                .finish_non_exhaustive(),
        }
    }
}

impl Delivery {
    /// Run every handler, then wake every waiter.
    ///
    /// A panicking handler is logged and skipped; the remaining handlers
    /// still run. Returns the number of handlers that panicked.
    #[must_use]
    pub fn deliver(self) -> usize {
        match self {
            Self::Quote {
                quote,
                handlers,
                waiters,
            } => {
                let panics = run_isolated(&handlers, "quote", &quote.symbol, |handler| {
                    handler(&quote);
                });
                for waiter in waiters {
                    let _ = waiter.send(quote.clone());
                }
                panics
            }
            Self::Candle {
                key,
                candle,
                handlers,
                waiters,
            } => {
                let panics = run_isolated(&handlers, "candle", &key, |handler| {
                    handler(&key, &candle);
                });
                for waiter in waiters {
                    let _ = waiter.send(candle);
                }
                panics
            }
            Self::Study {
                key,
                values,
                handlers,
                waiters,
            } => {
                let panics = run_isolated(&handlers, "study", &key, |handler| {
                    handler(&key, &values);
                });
                for waiter in waiters {
                    let _ = waiter.send(values.clone());
                }
                panics
            }
        }
    }
}

fn run_isolated<H>(
    handlers: &[H],
    kind: &str,
    key: &dyn std::fmt::Display,
    call: impl Fn(&H),
) -> usize {
    let mut panics = 0;
    for handler in handlers {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| call(handler))) {
            panics += 1;
            let message = payload
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(kind, key = %key, panic = %message, "callback panicked");
        }
    }
    panics
}
