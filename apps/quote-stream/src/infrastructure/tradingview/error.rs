//! Client Errors

use std::time::Duration;

use thiserror::Error;

use super::codec::CodecError;
use crate::application::ports::{AuthError, TransportError};
use crate::domain::subscription::SubscriptionError;

/// Errors returned by [`StreamClient`](super::StreamClient) and reported on
/// the connection status channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Dial or handshake failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed frame or payload.
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// Rejected subscription request.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// A `wait_for_*` call ran out of time.
    #[error("timed out after {after:?} waiting for {key}")]
    Timeout {
        /// The timeout given by the caller.
        after: Duration,
        /// Key that was waited on.
        key: String,
    },

    /// Credential failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// `wait_for_*` requires a non-zero timeout.
    #[error("timeout must be greater than zero")]
    InvalidTimeout,

    /// The client was disconnected.
    #[error("client is closed")]
    Closed,
}

impl From<TransportError> for StreamError {
    fn from(error: TransportError) -> Self {
        Self::Connection(error.to_string())
    }
}
