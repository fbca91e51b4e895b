//! Market Data Types
//!
//! Value types shared by every layer: symbols, chart intervals, quote
//! snapshots, OHLCV candles and study outputs, plus the keys used to index
//! them in the cache and callback registries.
//!
//! # Keys
//!
//! | Data   | Key                                   |
//! |--------|---------------------------------------|
//! | Quote  | `Symbol`                              |
//! | Candle | [`ChartKey`] (symbol, interval)       |
//! | Study  | [`StudyKey`] (symbol, interval, name) |

pub mod fields;
pub mod indicator;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use fields::default_quote_fields;
pub use indicator::Indicator;

// =============================================================================
// Symbols
// =============================================================================

/// A ticker as the consumer names it (e.g. `THYAO`, or `NASDAQ:AAPL`).
pub type Symbol = String;

/// Normalize a consumer supplied ticker: trimmed and upper-cased.
///
/// Returns `None` for empty input or input containing whitespace.
#[must_use]
pub fn normalize_symbol(raw: &str) -> Option<Symbol> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return None;
    }
    Some(trimmed.to_uppercase())
}

// =============================================================================
// Interval
// =============================================================================

/// Chart bar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Interval {
    /// One minute bars.
    #[serde(rename = "1m")]
    OneMinute,
    /// Five minute bars.
    #[serde(rename = "5m")]
    FiveMinutes,
    /// Fifteen minute bars.
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// Thirty minute bars.
    #[serde(rename = "30m")]
    ThirtyMinutes,
    /// Hourly bars.
    #[serde(rename = "1h")]
    OneHour,
    /// Two hour bars.
    #[serde(rename = "2h")]
    TwoHours,
    /// Four hour bars.
    #[serde(rename = "4h")]
    FourHours,
    /// Daily bars.
    #[serde(rename = "1d")]
    OneDay,
    /// Weekly bars.
    #[serde(rename = "1w")]
    OneWeek,
    /// Monthly bars.
    #[serde(rename = "1mo")]
    OneMonth,
}

impl Interval {
    /// All supported intervals, shortest first.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::OneMinute,
            Self::FiveMinutes,
            Self::FifteenMinutes,
            Self::ThirtyMinutes,
            Self::OneHour,
            Self::TwoHours,
            Self::FourHours,
            Self::OneDay,
            Self::OneWeek,
            Self::OneMonth,
        ]
    }

    /// Canonical short name (`1m`, `1h`, `1d`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::TwoHours => "2h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
            Self::OneWeek => "1w",
            Self::OneMonth => "1mo",
        }
    }

    /// Timeframe code understood by the chart service.
    #[must_use]
    pub const fn timeframe(self) -> &'static str {
        match self {
            Self::OneMinute => "1",
            Self::FiveMinutes => "5",
            Self::FifteenMinutes => "15",
            Self::ThirtyMinutes => "30",
            Self::OneHour => "60",
            Self::TwoHours => "120",
            Self::FourHours => "240",
            Self::OneDay => "1D",
            Self::OneWeek => "1W",
            Self::OneMonth => "1M",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized interval string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported interval: {0}")]
pub struct IntervalError(pub String);

impl FromStr for Interval {
    type Err = IntervalError;

    /// Parses the short names. `1M` is a month; every other form is
    /// case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == "1M" {
            return Ok(Self::OneMonth);
        }
        match trimmed.to_lowercase().as_str() {
            "1m" => Ok(Self::OneMinute),
            "5m" => Ok(Self::FiveMinutes),
            "15m" => Ok(Self::FifteenMinutes),
            "30m" => Ok(Self::ThirtyMinutes),
            "1h" => Ok(Self::OneHour),
            "2h" => Ok(Self::TwoHours),
            "4h" => Ok(Self::FourHours),
            "1d" => Ok(Self::OneDay),
            "1w" | "1wk" => Ok(Self::OneWeek),
            "1mo" => Ok(Self::OneMonth),
            _ => Err(IntervalError(s.to_string())),
        }
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Identifies one chart subscription and its candle buffer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChartKey {
    /// Normalized ticker.
    pub symbol: Symbol,
    /// Bar interval.
    pub interval: Interval,
}

impl ChartKey {
    /// Create a chart key.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
        }
    }
}

impl fmt::Display for ChartKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.interval)
    }
}

/// Identifies one study attached to a chart.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StudyKey {
    /// Normalized ticker.
    pub symbol: Symbol,
    /// Bar interval of the parent chart.
    pub interval: Interval,
    /// Display name of the indicator (`RSI`, `MACD`, ...).
    pub name: String,
}

impl StudyKey {
    /// Create a study key.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, interval: Interval, name: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            name: name.into(),
        }
    }

    /// The chart this study is attached to.
    #[must_use]
    pub fn chart(&self) -> ChartKey {
        ChartKey::new(self.symbol.clone(), self.interval)
    }
}

impl fmt::Display for StudyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.symbol, self.interval, self.name)
    }
}

// =============================================================================
// Quote
// =============================================================================

/// Latest known quote fields for one symbol.
///
/// Updates are partial: each one overwrites the fields it carries and leaves
/// the rest untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Normalized ticker the consumer subscribed with.
    pub symbol: Symbol,
    /// Exchange-qualified identifier (e.g. `BIST:THYAO`).
    pub exchange_symbol: String,
    /// Raw field values keyed by service field name (`lp`, `ch`, ...).
    pub fields: Map<String, Value>,
    /// When the snapshot last changed.
    pub updated_at: DateTime<Utc>,
}

impl Quote {
    /// Create an empty snapshot.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, exchange_symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange_symbol: exchange_symbol.into(),
            fields: Map::new(),
            updated_at: Utc::now(),
        }
    }

    /// Merge a partial update (last write wins per field).
    pub fn merge(&mut self, update: Map<String, Value>) {
        self.fields.extend(update);
        self.updated_at = Utc::now();
    }

    /// Raw field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Numeric field value.
    #[must_use]
    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }

    /// Text field value.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Last traded price.
    #[must_use]
    pub fn last(&self) -> Option<f64> {
        self.number("lp")
    }

    /// Absolute change versus previous close.
    #[must_use]
    pub fn change(&self) -> Option<f64> {
        self.number("ch")
    }

    /// Percent change versus previous close.
    #[must_use]
    pub fn change_percent(&self) -> Option<f64> {
        self.number("chp")
    }

    /// Session open.
    #[must_use]
    pub fn open(&self) -> Option<f64> {
        self.number("open_price")
    }

    /// Session high.
    #[must_use]
    pub fn high(&self) -> Option<f64> {
        self.number("high_price")
    }

    /// Session low.
    #[must_use]
    pub fn low(&self) -> Option<f64> {
        self.number("low_price")
    }

    /// Previous session close.
    #[must_use]
    pub fn prev_close(&self) -> Option<f64> {
        self.number("prev_close_price")
    }

    /// Session volume.
    #[must_use]
    pub fn volume(&self) -> Option<f64> {
        self.number("volume")
    }

    /// Best bid.
    #[must_use]
    pub fn bid(&self) -> Option<f64> {
        self.number("bid")
    }

    /// Best ask.
    #[must_use]
    pub fn ask(&self) -> Option<f64> {
        self.number("ask")
    }

    /// Size at best bid.
    #[must_use]
    pub fn bid_size(&self) -> Option<f64> {
        self.number("bid_size")
    }

    /// Size at best ask.
    #[must_use]
    pub fn ask_size(&self) -> Option<f64> {
        self.number("ask_size")
    }

    /// Time of the last trade as a unix timestamp.
    #[must_use]
    pub fn last_time(&self) -> Option<i64> {
        self.fields.get("lp_time").and_then(Value::as_i64)
    }

    /// Instrument description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.text("description")
    }

    /// Listing exchange reported by the service.
    #[must_use]
    pub fn exchange(&self) -> Option<&str> {
        self.text("exchange")
    }

    /// Quote currency.
    #[must_use]
    pub fn currency(&self) -> Option<&str> {
        self.text("currency_code")
    }

    /// Market capitalization.
    #[must_use]
    pub fn market_cap(&self) -> Option<f64> {
        self.number("market_cap_basic")
    }

    /// Trailing price/earnings ratio.
    #[must_use]
    pub fn pe_ratio(&self) -> Option<f64> {
        self.number("price_earnings_ttm")
    }

    /// Trailing earnings per share.
    #[must_use]
    pub fn eps(&self) -> Option<f64> {
        self.number("earnings_per_share_basic_ttm")
    }

    /// Dividend yield.
    #[must_use]
    pub fn dividend_yield(&self) -> Option<f64> {
        self.number("dividends_yield")
    }

    /// One year beta.
    #[must_use]
    pub fn beta(&self) -> Option<f64> {
        self.number("beta_1_year")
    }

    /// 52 week high.
    #[must_use]
    pub fn high_52_week(&self) -> Option<f64> {
        self.number("high_52_week")
    }

    /// 52 week low.
    #[must_use]
    pub fn low_52_week(&self) -> Option<f64> {
        self.number("low_52_week")
    }
}

// =============================================================================
// Candle
// =============================================================================

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, unix seconds.
    pub time: i64,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close (or latest) price.
    pub close: f64,
    /// Volume; zero when the service omits it.
    pub volume: f64,
}

impl Candle {
    /// Build a bar from a `[time, open, high, low, close, volume]` row.
    ///
    /// Returns `None` when a price column is missing or not numeric.
    #[must_use]
    pub fn from_row(row: &[Value]) -> Option<Self> {
        let number = |i: usize| row.get(i).and_then(Value::as_f64);
        #[allow(clippy::cast_possible_truncation)]
        let time = row
            .first()
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))?;
        Some(Self {
            time,
            open: number(1)?,
            high: number(2)?,
            low: number(3)?,
            close: number(4)?,
            volume: number(5).unwrap_or(0.0),
        })
    }
}

// =============================================================================
// Studies
// =============================================================================

/// Consumer supplied study inputs, e.g. `{"length": 14}`.
///
/// Inputs are sent to the service in key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyParams(Map<String, Value>);

impl StudyParams {
    /// Empty parameter set (indicator defaults).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one input.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Iterate inputs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of inputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no inputs were given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for StudyParams {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Latest output of a study.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyValues {
    /// Bar time the values belong to, unix seconds.
    pub time: Option<i64>,
    /// Output name to value (`value`, `macd`, `signal`, ...).
    pub values: BTreeMap<String, f64>,
}

impl StudyValues {
    /// A single named output.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Whether the row carried no usable output.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
