//! Domain Layer - Streaming state with no I/O.
//!
//! Everything here is plain data plus the rules that keep it consistent:
//! market value types, the cache of latest values, the desired
//! subscriptions and the per-connection session index.

/// Symbols, intervals, quotes, candles and study types.
pub mod market;

/// Latest quote, candle series and study output per key.
pub mod cache;

/// Desired subscriptions and their lifecycle state.
pub mod subscription;

/// Per-connection session identifiers.
pub mod session;
