//! Port Interfaces
//!
//! Collaborators the streaming core consumes, passed explicitly to the
//! client at construction.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Connector`]: opens a text-frame transport to the streaming service
//! - [`SymbolResolver`]: maps a ticker to the exchange-qualified id
//! - [`CredentialProvider`]: supplies an auth token or declares anonymous mode

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};
use thiserror::Error;

use crate::domain::subscription::SubscriptionError;

// =============================================================================
// Transport
// =============================================================================

/// Transport level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Dialing the service failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading from the transport failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The peer closed the transport.
    #[error("transport closed")]
    Closed,
}

/// Outbound half of a transport: one text frame per item.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a transport: one text chunk per item.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open transport.
pub struct Transport {
    /// Outbound frames.
    pub sink: FrameSink,
    /// Inbound chunks. The stream ending means the peer closed.
    pub stream: FrameStream,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports to the streaming service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial once.
    async fn connect(&self) -> Result<Transport, TransportError>;
}

// =============================================================================
// Credentials
// =============================================================================

/// Token sent in place of a credential in anonymous mode.
pub const ANONYMOUS_TOKEN: &str = "unauthorized_user_token";

/// Credential failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// A token was configured but is empty.
    #[error("auth token is empty")]
    EmptyToken,

    /// The service rejected the credential.
    #[error("credential rejected: {0}")]
    Rejected(String),

    /// The provider could not produce a credential.
    #[error("credential provider failed: {0}")]
    Provider(String),
}

/// An auth token. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::EmptyToken`] for blank input.
    pub fn new(token: impl Into<String>) -> Result<Self, AuthError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(Self(token))
    }

    /// The raw token.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// What the client authenticates with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Authenticated session (real-time tier, depending on the account).
    Token(AuthToken),
    /// Anonymous session (delayed data).
    Anonymous,
}

impl Credential {
    /// Token as sent in `set_auth_token`.
    #[must_use]
    pub fn wire_token(&self) -> &str {
        match self {
            Self::Token(token) => token.expose(),
            Self::Anonymous => ANONYMOUS_TOKEN,
        }
    }

    /// Whether this is anonymous mode.
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

/// Supplies the credential used on each handshake.
///
/// Called once per connection attempt so that rotated tokens are picked up
/// on reconnect.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialProvider: Send + Sync {
    /// Current credential.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] if no usable credential is available.
    fn credential(&self) -> Result<Credential, AuthError>;
}

// =============================================================================
// Symbol Resolution
// =============================================================================

/// Maps a normalized ticker to the id the streaming service expects.
#[cfg_attr(test, mockall::automock)]
pub trait SymbolResolver: Send + Sync {
    /// Resolve one ticker.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Unresolved`] when the ticker cannot be
    /// mapped.
    fn resolve(&self, symbol: &str) -> Result<String, SubscriptionError>;
}

/// Prefixes bare tickers with a default exchange (`THYAO` becomes
/// `BIST:THYAO`); already qualified ids pass through.
#[derive(Debug, Clone)]
pub struct ExchangeResolver {
    exchange: String,
}

impl ExchangeResolver {
    /// Resolver for the given default exchange.
    #[must_use]
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into().trim().to_uppercase(),
        }
    }

    /// The default exchange.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

impl Default for ExchangeResolver {
    fn default() -> Self {
        Self::new("BIST")
    }
}

impl SymbolResolver for ExchangeResolver {
    fn resolve(&self, symbol: &str) -> Result<String, SubscriptionError> {
        match symbol.split_once(':') {
            Some((exchange, ticker)) if !exchange.is_empty() && !ticker.is_empty() => {
                Ok(symbol.to_string())
            }
            Some(_) => Err(SubscriptionError::Unresolved {
                symbol: symbol.to_string(),
                reason: "empty exchange or ticker".to_string(),
            }),
            None if self.exchange.is_empty() => Err(SubscriptionError::Unresolved {
                symbol: symbol.to_string(),
                reason: "no default exchange configured".to_string(),
            }),
            None => Ok(format!("{}:{symbol}", self.exchange)),
        }
    }
}
