//! Application Services
//!
//! State shared by the consumer API and the read loop.
//!
//! - `state`: the single lock around table, registry, cache and observers
//! - `callbacks`: handler registry, waiters and out-of-lock delivery

/// Handler registry, waiters and delivery.
pub mod callbacks;

/// Shared stream state.
pub mod state;

pub use callbacks::{
    CallbackId, CallbackRegistry, CandleHandler, Delivery, QuoteHandler, StudyHandler, Waiters,
};
pub use state::{SharedState, StreamState, shared_state};
