//! Client Configuration Settings
//!
//! Configuration types for the streaming client, loaded from environment
//! variables. Every field has a default; unparsable numbers fall back to it.

use std::fmt;
use std::time::Duration;

use crate::domain::cache::DEFAULT_CANDLE_CAPACITY;
use crate::domain::market::{Interval, Symbol, default_quote_fields, normalize_symbol};
use crate::infrastructure::tradingview::{DispatchMode, HeartbeatConfig, ReconnectConfig};

/// Default streaming endpoint.
pub const DEFAULT_URL: &str = "wss://data.tradingview.com/socket.io/websocket?type=chart";

/// Origin header the endpoint expects.
pub const DEFAULT_ORIGIN: &str = "https://www.tradingview.com";

/// Exchange prefixed to bare tickers.
pub const DEFAULT_EXCHANGE: &str = "BIST";

/// Bars requested per chart series.
pub const DEFAULT_BAR_COUNT: u32 = 300;

/// Capacity of the delivery worker queue.
pub const DEFAULT_WORKER_CAPACITY: usize = 1024;

/// What subscribe calls do while the client is not connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfflinePolicy {
    /// Record the subscription; it is sent on the next handshake.
    #[default]
    Queue,
    /// Fail with `NotConnected`.
    Reject,
}

impl OfflinePolicy {
    /// Parse from a config value (`queue` or `reject`).
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "queue" => Some(Self::Queue),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }

    /// Config value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Reject => "reject",
        }
    }
}

/// Complete client configuration.
#[derive(Clone)]
pub struct StreamConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// `Origin` header sent on upgrade.
    pub origin: String,
    /// Exchange prefixed to bare tickers.
    pub default_exchange: String,
    /// Auth token; `None` means anonymous (delayed data).
    pub auth_token: Option<String>,
    /// Bars kept per chart.
    pub candle_capacity: usize,
    /// Bars requested when a series is created.
    pub series_bar_count: u32,
    /// Limit for dialing.
    pub connect_timeout: Duration,
    /// Limit for the server hello after dialing.
    pub handshake_timeout: Duration,
    /// Inbound activity watchdog.
    pub heartbeat: HeartbeatConfig,
    /// Backoff between connection attempts.
    pub reconnect: ReconnectConfig,
    /// Where callbacks run.
    pub dispatch: DispatchMode,
    /// Behavior of subscribe calls while offline.
    pub offline_policy: OfflinePolicy,
    /// Fields requested on the quote session.
    pub quote_fields: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            default_exchange: DEFAULT_EXCHANGE.to_string(),
            auth_token: None,
            candle_capacity: DEFAULT_CANDLE_CAPACITY,
            series_bar_count: DEFAULT_BAR_COUNT,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            dispatch: DispatchMode::Inline,
            offline_policy: OfflinePolicy::Queue,
            quote_fields: default_quote_fields(),
        }
    }
}

impl fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConfig")
            .field("url", &self.url)
            .field("origin", &self.origin)
            .field("default_exchange", &self.default_exchange)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("candle_capacity", &self.candle_capacity)
            .field("series_bar_count", &self.series_bar_count)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("heartbeat", &self.heartbeat)
            .field("reconnect", &self.reconnect)
            .field("dispatch", &self.dispatch)
            .field("offline_policy", &self.offline_policy)
            .field("quote_fields", &self.quote_fields.len())
            .finish()
    }
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an unusable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from any key/value source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an unusable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let env = Env(&lookup);

        let auth_token = match env.string("TRADINGVIEW_AUTH_TOKEN") {
            Some(token) if token.trim().is_empty() => {
                return Err(ConfigError::EmptyValue("TRADINGVIEW_AUTH_TOKEN".to_string()));
            }
            token => token,
        };

        let heartbeat = HeartbeatConfig::new(
            env.duration_secs(
                "QUOTE_STREAM_HEARTBEAT_CHECK_INTERVAL_SECS",
                defaults.heartbeat.check_interval,
            ),
            env.duration_secs(
                "QUOTE_STREAM_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat.timeout,
            ),
        );

        let reconnect = ReconnectConfig {
            initial_delay: env.duration_millis(
                "QUOTE_STREAM_RECONNECT_INITIAL_DELAY_MS",
                defaults.reconnect.initial_delay,
            ),
            max_delay: env.duration_secs(
                "QUOTE_STREAM_RECONNECT_MAX_DELAY_SECS",
                defaults.reconnect.max_delay,
            ),
            multiplier: env.f64(
                "QUOTE_STREAM_RECONNECT_MULTIPLIER",
                defaults.reconnect.multiplier,
            ),
            jitter_factor: env.f64(
                "QUOTE_STREAM_RECONNECT_JITTER_FACTOR",
                defaults.reconnect.jitter_factor,
            ),
            max_attempts: env.u32(
                "QUOTE_STREAM_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts,
            ),
        };

        let worker_capacity = env.usize("QUOTE_STREAM_WORKER_CAPACITY", DEFAULT_WORKER_CAPACITY);
        let dispatch = match env.string("QUOTE_STREAM_DISPATCH") {
            None => defaults.dispatch,
            Some(value) => match value.trim().to_lowercase().as_str() {
                "inline" => DispatchMode::Inline,
                "worker" => DispatchMode::Worker(worker_capacity),
                _ => return Err(ConfigError::invalid("QUOTE_STREAM_DISPATCH", &value)),
            },
        };

        let offline_policy = match env.string("QUOTE_STREAM_OFFLINE_POLICY") {
            None => defaults.offline_policy,
            Some(value) => OfflinePolicy::from_str_case_insensitive(&value)
                .ok_or_else(|| ConfigError::invalid("QUOTE_STREAM_OFFLINE_POLICY", &value))?,
        };

        Ok(Self {
            url: env.string("QUOTE_STREAM_URL").unwrap_or(defaults.url),
            origin: env.string("QUOTE_STREAM_ORIGIN").unwrap_or(defaults.origin),
            default_exchange: env
                .string("QUOTE_STREAM_EXCHANGE")
                .unwrap_or(defaults.default_exchange),
            auth_token,
            candle_capacity: env
                .usize("QUOTE_STREAM_CANDLE_CAPACITY", defaults.candle_capacity)
                .max(1),
            series_bar_count: env.u32("QUOTE_STREAM_BAR_COUNT", defaults.series_bar_count),
            connect_timeout: env.duration_secs(
                "QUOTE_STREAM_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
            handshake_timeout: env.duration_secs(
                "QUOTE_STREAM_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout,
            ),
            heartbeat,
            reconnect,
            dispatch,
            offline_policy,
            quote_fields: defaults.quote_fields,
        })
    }
}

/// Settings of the daemon binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    /// Quote symbols to subscribe at startup.
    pub symbols: Vec<Symbol>,
    /// Charts to subscribe at startup.
    pub charts: Vec<(Symbol, Interval)>,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            charts: Vec::new(),
            health_port: 8083,
        }
    }
}

impl DaemonSettings {
    /// Create settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed symbol or chart entry.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create settings from any key/value source.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed symbol or chart entry.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let symbols = env
            .list("QUOTE_STREAM_SYMBOLS")
            .into_iter()
            .map(|raw| {
                normalize_symbol(&raw).ok_or_else(|| ConfigError::invalid("QUOTE_STREAM_SYMBOLS", &raw))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let charts = env
            .list("QUOTE_STREAM_CHARTS")
            .into_iter()
            .map(|raw| parse_chart(&raw).ok_or_else(|| ConfigError::invalid("QUOTE_STREAM_CHARTS", &raw)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            symbols,
            charts,
            health_port: env.u16("QUOTE_STREAM_HEALTH_PORT", Self::default().health_port),
        })
    }
}

/// `SYMBOL@interval`
fn parse_chart(raw: &str) -> Option<(Symbol, Interval)> {
    let (symbol, interval) = raw.split_once('@')?;
    Some((normalize_symbol(symbol)?, interval.trim().parse().ok()?))
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has a value that cannot be used.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

// =============================================================================
// Env Parsing
// =============================================================================

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.string(key).and_then(|v| v.trim().parse().ok())
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parse(key).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parse(key).unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parse(key).unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parse(key).unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key).map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key).map_or(default, Duration::from_millis)
    }

    /// Comma separated, blanks dropped.
    fn list(&self, key: &str) -> Vec<String> {
        self.string(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = StreamConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.default_exchange, "BIST");
        assert_eq!(config.auth_token, None);
        assert_eq!(config.candle_capacity, 500);
        assert_eq!(config.series_bar_count, 300);
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(config.dispatch, DispatchMode::Inline);
        assert_eq!(config.offline_policy, OfflinePolicy::Queue);
        assert_eq!(config.quote_fields.len(), 43);
    }

    #[test]
    fn default_fields_come_from_the_market_module() {
        let fields = default_quote_fields();
        assert_eq!(StreamConfig::default().quote_fields, fields);
        assert_eq!(fields.first().map(String::as_str), Some("lp"));
    }

    #[test]
    fn overrides_from_environment() {
        let config = StreamConfig::from_lookup(lookup(&[
            ("QUOTE_STREAM_EXCHANGE", "NASDAQ"),
            ("TRADINGVIEW_AUTH_TOKEN", "tok"),
            ("QUOTE_STREAM_CANDLE_CAPACITY", "50"),
            ("QUOTE_STREAM_RECONNECT_MAX_DELAY_SECS", "5"),
            ("QUOTE_STREAM_DISPATCH", "Worker"),
            ("QUOTE_STREAM_WORKER_CAPACITY", "16"),
            ("QUOTE_STREAM_OFFLINE_POLICY", "reject"),
            ("QUOTE_STREAM_HANDSHAKE_TIMEOUT_SECS", "not-a-number"),
        ]))
        .unwrap();
        assert_eq!(config.default_exchange, "NASDAQ");
        assert_eq!(config.auth_token.as_deref(), Some("tok"));
        assert_eq!(config.candle_capacity, 50);
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(5));
        assert_eq!(config.dispatch, DispatchMode::Worker(16));
        assert_eq!(config.offline_policy, OfflinePolicy::Reject);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_enum_values_are_errors() {
        let error = StreamConfig::from_lookup(lookup(&[("QUOTE_STREAM_DISPATCH", "threads")])).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidValue { ref key, .. } if key == "QUOTE_STREAM_DISPATCH"));
        assert!(StreamConfig::from_lookup(lookup(&[("TRADINGVIEW_AUTH_TOKEN", " ")])).is_err());
    }

    #[test]
    fn debug_redacts_token() {
        let config = StreamConfig {
            auth_token: Some("secret456".to_string()),
            ..StreamConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn daemon_settings_parse_lists() {
        let settings = DaemonSettings::from_lookup(lookup(&[
            ("QUOTE_STREAM_SYMBOLS", "thyao, garan,,"),
            ("QUOTE_STREAM_CHARTS", "THYAO@1h,asels@1d"),
            ("QUOTE_STREAM_HEALTH_PORT", "9000"),
        ]))
        .unwrap();
        assert_eq!(settings.symbols, vec!["THYAO".to_string(), "GARAN".to_string()]);
        assert_eq!(
            settings.charts,
            vec![
                ("THYAO".to_string(), Interval::OneHour),
                ("ASELS".to_string(), Interval::OneDay),
            ]
        );
        assert_eq!(settings.health_port, 9000);
    }

    #[test]
    fn daemon_settings_reject_bad_chart() {
        let error = DaemonSettings::from_lookup(lookup(&[("QUOTE_STREAM_CHARTS", "THYAO@2m")])).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidValue { .. }));
        assert_eq!(DaemonSettings::from_lookup(lookup(&[])).unwrap(), DaemonSettings::default());
    }

    #[test]
    fn offline_policy_parsing() {
        assert_eq!(OfflinePolicy::from_str_case_insensitive("QUEUE"), Some(OfflinePolicy::Queue));
        assert_eq!(OfflinePolicy::from_str_case_insensitive("reject"), Some(OfflinePolicy::Reject));
        assert_eq!(OfflinePolicy::from_str_case_insensitive("drop"), None);
        assert_eq!(OfflinePolicy::Reject.as_str(), "reject");
    }
}
