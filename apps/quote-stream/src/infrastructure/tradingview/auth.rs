//! Credential Providers
//!
//! The streaming service accepts either a session auth token (real-time
//! data, depending on the account) or the anonymous placeholder token
//! (delayed data). The credential is sent in `set_auth_token` as the first
//! command of every handshake; there is no explicit acknowledgement, a bad
//! token shows up as `critical_error` or as quote errors.

use std::env;

use crate::application::ports::{AuthError, AuthToken, Credential, CredentialProvider};

/// Environment variable read by [`EnvToken`].
pub const AUTH_TOKEN_ENV: &str = "TRADINGVIEW_AUTH_TOKEN";

/// Anonymous mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl CredentialProvider for Anonymous {
    fn credential(&self) -> Result<Credential, AuthError> {
        Ok(Credential::Anonymous)
    }
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: AuthToken,
}

impl StaticToken {
    /// Provider for `token`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::EmptyToken`] for blank input.
    pub fn new(token: impl Into<String>) -> Result<Self, AuthError> {
        Ok(Self {
            token: AuthToken::new(token)?,
        })
    }
}

impl CredentialProvider for StaticToken {
    fn credential(&self) -> Result<Credential, AuthError> {
        Ok(Credential::Token(self.token.clone()))
    }
}

/// Reads the token from an environment variable on every handshake, so a
/// rotated token is picked up on reconnect. Falls back to anonymous mode
/// when the variable is unset.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    /// Provider reading `var`.
    #[must_use]
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvToken {
    fn default() -> Self {
        Self::new(AUTH_TOKEN_ENV)
    }
}

impl CredentialProvider for EnvToken {
    fn credential(&self) -> Result<Credential, AuthError> {
        match env::var(&self.var) {
            Ok(token) => AuthToken::new(token).map(Credential::Token),
            Err(env::VarError::NotPresent) => Ok(Credential::Anonymous),
            Err(env::VarError::NotUnicode(_)) => Err(AuthError::Provider(format!(
                "{} is not valid unicode",
                self.var
            ))),
        }
    }
}

/// Provider for an optional configured token: [`StaticToken`] when present,
/// [`Anonymous`] otherwise.
///
/// # Errors
///
/// Returns [`AuthError::EmptyToken`] when the token is present but blank.
pub fn from_token(token: Option<&str>) -> Result<Box<dyn CredentialProvider>, AuthError> {
    match token {
        Some(token) => Ok(Box::new(StaticToken::new(token)?)),
        None => Ok(Box::new(Anonymous)),
    }
}
