//! Cache Store
//!
//! Latest known quote, candle series and study output per key. Reads never
//! block and return owned snapshots, so callers can hold them while the
//! dispatcher keeps writing.
//!
//! # Candle Merge
//!
//! - Same timestamp as the newest bar: replace it (intra-bar tick)
//! - Newer timestamp: append, evicting the oldest bar beyond capacity
//! - Older timestamp: dropped as stale
//!
//! Entries survive reconnects. They go stale while disconnected and are
//! refreshed by the replayed subscriptions.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde_json::{Map, Value};

use super::market::{Candle, ChartKey, Interval, Quote, StudyKey, StudyValues, Symbol};

/// Default number of bars kept per chart.
pub const DEFAULT_CANDLE_CAPACITY: usize = 500;

// =============================================================================
// Candle Buffer
// =============================================================================

/// Result of merging one bar into a [`CandleBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleMerge {
    /// Replaced the newest bar (same timestamp).
    Replaced,
    /// Appended a new bar.
    Appended,
    /// Appended a new bar and evicted the oldest one.
    Evicted,
    /// Ignored: older than the newest bar.
    Stale,
}

impl CandleMerge {
    /// Whether the buffer changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Stale)
    }
}

/// Bounded, time ordered bar sequence. Newest bar at the tail.
#[derive(Debug, Clone)]
pub struct CandleBuffer {
    bars: VecDeque<Candle>,
    capacity: usize,
}

impl CandleBuffer {
    /// Create an empty buffer. A zero capacity is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bars: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Merge one bar.
    pub fn push(&mut self, candle: Candle) -> CandleMerge {
        match self.bars.back_mut() {
            Some(last) if last.time == candle.time => {
                *last = candle;
                CandleMerge::Replaced
            }
            Some(last) if last.time > candle.time => CandleMerge::Stale,
            _ => {
                self.bars.push_back(candle);
                if self.bars.len() > self.capacity {
                    self.bars.pop_front();
                    CandleMerge::Evicted
                } else {
                    CandleMerge::Appended
                }
            }
        }
    }

    /// Newest bar.
    #[must_use]
    pub fn last(&self) -> Option<&Candle> {
        self.bars.back()
    }

    /// Copy of all bars, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Candle> {
        self.bars.iter().copied().collect()
    }

    /// Copy of the newest `count` bars, oldest first.
    #[must_use]
    pub fn tail(&self, count: usize) -> Vec<Candle> {
        let skip = self.bars.len().saturating_sub(count);
        self.bars.iter().skip(skip).copied().collect()
    }

    /// Number of buffered bars.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    /// Whether no bar has been received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Maximum number of bars kept.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

// =============================================================================
// Cache Store
// =============================================================================

/// Latest values per subscribed key.
#[derive(Debug)]
pub struct CacheStore {
    quotes: HashMap<Symbol, Quote>,
    candles: HashMap<ChartKey, CandleBuffer>,
    studies: HashMap<StudyKey, StudyValues>,
    candle_capacity: usize,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_CANDLE_CAPACITY)
    }
}

impl CacheStore {
    /// Create an empty store keeping `candle_capacity` bars per chart.
    #[must_use]
    pub fn new(candle_capacity: usize) -> Self {
        Self {
            quotes: HashMap::new(),
            candles: HashMap::new(),
            studies: HashMap::new(),
            candle_capacity,
        }
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Merge quote fields and return the updated snapshot.
    pub fn update_quote(
        &mut self,
        symbol: &str,
        exchange_symbol: &str,
        fields: Map<String, Value>,
    ) -> &Quote {
        let quote = self
            .quotes
            .entry(symbol.to_string())
            .or_insert_with(|| Quote::new(symbol, exchange_symbol));
        quote.merge(fields);
        quote
    }

    /// Merge one bar into the chart's buffer.
    pub fn update_candle(&mut self, key: &ChartKey, candle: Candle) -> CandleMerge {
        let capacity = self.candle_capacity;
        self.candles
            .entry(key.clone())
            .or_insert_with(|| CandleBuffer::new(capacity))
            .push(candle)
    }

    /// Replace a study's output.
    pub fn update_study(&mut self, key: &StudyKey, values: StudyValues) {
        self.studies.insert(key.clone(), values);
    }

    /// Seed `to` with a copy of the snapshot cached under `from`.
    ///
    /// Returns `false` when nothing is cached under `from`.
    pub fn copy_quote(&mut self, from: &str, to: &str) -> bool {
        let Some(mut quote) = self.quotes.get(from).cloned() else {
            return false;
        };
        quote.symbol = to.to_string();
        self.quotes.insert(to.to_string(), quote);
        true
    }

    /// Drop a quote.
    pub fn remove_quote(&mut self, symbol: &str) -> Option<Quote> {
        self.quotes.remove(symbol)
    }

    /// Drop a chart's bars and every study attached to it.
    pub fn remove_chart(&mut self, key: &ChartKey) {
        self.candles.remove(key);
        self.studies
            .retain(|study, _| !(study.symbol == key.symbol && study.interval == key.interval));
    }

    /// Drop one study output.
    pub fn remove_study(&mut self, key: &StudyKey) -> Option<StudyValues> {
        self.studies.remove(key)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.quotes.clear();
        self.candles.clear();
        self.studies.clear();
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Snapshot of one quote.
    #[must_use]
    pub fn get_quote(&self, symbol: &str) -> Option<Quote> {
        self.quotes.get(symbol).cloned()
    }

    /// Snapshot of every quote.
    #[must_use]
    pub fn all_quotes(&self) -> BTreeMap<Symbol, Quote> {
        self.quotes
            .iter()
            .map(|(symbol, quote)| (symbol.clone(), quote.clone()))
            .collect()
    }

    /// Newest bar of a chart.
    #[must_use]
    pub fn get_candle(&self, key: &ChartKey) -> Option<Candle> {
        self.candles.get(key).and_then(CandleBuffer::last).copied()
    }

    /// Buffered bars of a chart, oldest first; `limit` keeps the newest N.
    #[must_use]
    pub fn get_candles(&self, key: &ChartKey, limit: Option<usize>) -> Vec<Candle> {
        self.candles.get(key).map_or_else(Vec::new, |buffer| {
            limit.map_or_else(|| buffer.to_vec(), |count| buffer.tail(count))
        })
    }

    /// Latest output of one study.
    #[must_use]
    pub fn get_study(&self, key: &StudyKey) -> Option<StudyValues> {
        self.studies.get(key).cloned()
    }

    /// Latest outputs of every study on a chart, keyed by study name.
    #[must_use]
    pub fn get_studies(&self, symbol: &str, interval: Interval) -> BTreeMap<String, StudyValues> {
        self.studies
            .iter()
            .filter(|(key, _)| key.symbol == symbol && key.interval == interval)
            .map(|(key, values)| (key.name.clone(), values.clone()))
            .collect()
    }

    /// Configured bars per chart.
    #[must_use]
    pub const fn candle_capacity(&self) -> usize {
        self.candle_capacity
    }
}
