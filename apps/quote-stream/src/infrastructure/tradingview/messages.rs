//! Streaming Service Message Types
//!
//! Outbound command builders and the closed set of inbound message kinds.
//!
//! # Inbound Messages
//!
//! ## Quote session
//! - `qsd`: quote field update `[qs, {"n": symbol, "s": "ok"|"error", "v": {...}}]`
//! - `quote_completed`: initial snapshot delivered `[qs, symbol]`
//!
//! ## Chart session
//! - `timescale_update` / `du`: bars and study rows
//!   `[cs, {"$prices": {"s": [{"i": 0, "v": [t, o, h, l, c, vol]}]}, "st1": {"st": [...]}}]`
//! - `symbol_resolved`, `series_completed`: series acknowledgements
//! - `study_loading`, `study_completed`: study acknowledgements `[cs, study_id]`
//! - `series_error`, `symbol_error`, `study_error`: per-subscription failures
//!
//! ## Connection
//! - `critical_error`, `protocol_error`: the server is about to drop us
//!
//! Anything else parses as [`ServerMessage::Unknown`] and is ignored.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::codec::{CodecError, Message};
use crate::domain::market::{Candle, Indicator, StudyParams};

/// Price series id inside a chart session.
pub const PRICE_SERIES: &str = "$prices";

/// Series index of the price series.
pub const PRICE_SERIES_INDEX: &str = "s1";

/// Parent id studies are attached to.
pub const STUDY_PARENT: &str = "st1";

/// Script type of every study.
pub const STUDY_SCRIPT: &str = "Script@tv-scripting-101!";

// =============================================================================
// Outbound Commands
// =============================================================================

/// `set_auth_token [token]`
#[must_use]
pub fn set_auth_token(token: &str) -> Message {
    Message::new("set_auth_token", vec![json!(token)])
}

/// `quote_create_session [qs]`
#[must_use]
pub fn quote_create_session(session: &str) -> Message {
    Message::new("quote_create_session", vec![json!(session)])
}

/// `quote_set_fields [qs, field...]`
#[must_use]
pub fn quote_set_fields(session: &str, fields: &[String]) -> Message {
    let mut params = Vec::with_capacity(fields.len() + 1);
    params.push(json!(session));
    params.extend(fields.iter().map(|field| json!(field)));
    Message::new("quote_set_fields", params)
}

/// `quote_add_symbols [qs, symbol...]`
#[must_use]
pub fn quote_add_symbols(session: &str, symbols: &[&str]) -> Message {
    let mut params = vec![json!(session)];
    params.extend(symbols.iter().map(|symbol| json!(symbol)));
    Message::new("quote_add_symbols", params)
}

/// `quote_remove_symbols [qs, symbol...]`
#[must_use]
pub fn quote_remove_symbols(session: &str, symbols: &[&str]) -> Message {
    let mut params = vec![json!(session)];
    params.extend(symbols.iter().map(|symbol| json!(symbol)));
    Message::new("quote_remove_symbols", params)
}

/// `chart_create_session [cs, ""]`
#[must_use]
pub fn chart_create_session(session: &str) -> Message {
    Message::new("chart_create_session", vec![json!(session), json!("")])
}

/// `chart_delete_session [cs]`
#[must_use]
pub fn chart_delete_session(session: &str) -> Message {
    Message::new("chart_delete_session", vec![json!(session)])
}

/// `resolve_symbol [cs, series_id, "={symbol config}"]`
#[must_use]
pub fn resolve_symbol(session: &str, series_id: &str, exchange_symbol: &str) -> Message {
    let config = json!({
        "adjustment": "splits",
        "session": "regular",
        "symbol": exchange_symbol,
    });
    Message::new(
        "resolve_symbol",
        vec![json!(session), json!(series_id), json!(format!("={config}"))],
    )
}

/// `create_series [cs, "$prices", "s1", series_id, timeframe, bar_count]`
#[must_use]
pub fn create_series(session: &str, series_id: &str, timeframe: &str, bar_count: u32) -> Message {
    Message::new(
        "create_series",
        vec![
            json!(session),
            json!(PRICE_SERIES),
            json!(PRICE_SERIES_INDEX),
            json!(series_id),
            json!(timeframe),
            json!(bar_count),
        ],
    )
}

/// `remove_series [cs, "$prices"]`
#[must_use]
pub fn remove_series(session: &str) -> Message {
    Message::new("remove_series", vec![json!(session), json!(PRICE_SERIES)])
}

/// `create_study [cs, study_id, "st1", "$prices", script, inputs]`
#[must_use]
pub fn create_study(
    session: &str,
    study_id: &str,
    indicator: &Indicator,
    params: &StudyParams,
) -> Message {
    Message::new(
        "create_study",
        vec![
            json!(session),
            json!(study_id),
            json!(STUDY_PARENT),
            json!(PRICE_SERIES),
            json!(STUDY_SCRIPT),
            study_inputs(indicator, params),
        ],
    )
}

/// `remove_study [cs, study_id]`
#[must_use]
pub fn remove_study(session: &str, study_id: &str) -> Message {
    Message::new("remove_study", vec![json!(session), json!(study_id)])
}

/// Study inputs: `pineId`, `pineVersion` and one typed `in_N` entry per
/// parameter in key order.
#[must_use]
pub fn study_inputs(indicator: &Indicator, params: &StudyParams) -> Value {
    let mut inputs = Map::new();
    inputs.insert("pineId".to_string(), json!(indicator.script_id()));
    inputs.insert("pineVersion".to_string(), json!("last"));

    for (index, (_, value)) in params.iter().enumerate() {
        let (value, kind) = match value {
            Value::Bool(_) => (value.clone(), "boolean"),
            Value::Number(n) if n.is_i64() || n.is_u64() => (value.clone(), "integer"),
            Value::Number(_) => (value.clone(), "float"),
            Value::String(_) => (value.clone(), "string"),
            other => (Value::String(other.to_string()), "string"),
        };
        inputs.insert(
            format!("in_{index}"),
            json!({"v": value, "f": true, "t": kind}),
        );
    }

    Value::Object(inputs)
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// Status of a quote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteStatus {
    /// Fields are valid.
    Ok,
    /// The symbol was rejected.
    Error,
}

/// A `qsd` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuoteData {
    /// Exchange-qualified symbol.
    #[serde(rename = "n")]
    pub name: String,
    /// Update status.
    #[serde(rename = "s")]
    pub status: QuoteStatus,
    /// Changed fields.
    #[serde(rename = "v", default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct SeriesRow {
    #[serde(default)]
    v: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct SeriesBlock {
    #[serde(default)]
    s: Vec<SeriesRow>,
    #[serde(default)]
    st: Vec<SeriesRow>,
}

/// Latest row of one study in a data update.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyRow {
    /// Study id (`stN`).
    pub study_id: String,
    /// `[time, plot_0, plot_1, ...]`
    pub row: Vec<Value>,
}

/// A `timescale_update` / `du` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesData {
    /// Chart session id.
    pub session: String,
    /// Bars of the price series, in message order.
    pub bars: Vec<Candle>,
    /// Latest row per study.
    pub studies: Vec<StudyRow>,
}

/// Session and subscription acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// Initial quote snapshot delivered.
    QuoteCompleted {
        /// Quote session id.
        session: String,
        /// Exchange-qualified symbol.
        symbol: String,
    },
    /// Chart symbol resolved.
    SymbolResolved {
        /// Chart session id.
        session: String,
    },
    /// Initial bars delivered.
    SeriesCompleted {
        /// Chart session id.
        session: String,
    },
    /// Study accepted and computing.
    StudyLoading {
        /// Chart session id.
        session: String,
        /// Study id.
        study_id: String,
    },
    /// Study computed.
    StudyCompleted {
        /// Chart session id.
        session: String,
        /// Study id.
        study_id: String,
    },
}

/// Errors reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// The chart series failed.
    Series {
        /// Chart session id.
        session: String,
        /// Service detail.
        detail: String,
    },
    /// The chart symbol could not be resolved.
    Symbol {
        /// Chart session id.
        session: String,
        /// Service detail.
        detail: String,
    },
    /// A study failed.
    Study {
        /// Chart session id.
        session: String,
        /// Study id.
        study_id: String,
        /// Service detail.
        detail: String,
    },
    /// Connection level failure.
    Critical {
        /// Service detail.
        detail: String,
    },
    /// The service rejected our framing or a command.
    Protocol {
        /// Service detail.
        detail: String,
    },
}

/// Closed set of inbound message kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Quote field update.
    Quote {
        /// Quote session id.
        session: String,
        /// Payload.
        data: QuoteData,
    },
    /// Bars and study rows.
    Series(SeriesData),
    /// Acknowledgement.
    Ack(Ack),
    /// Service error.
    Error(ServerError),
    /// Unrecognized method, ignored.
    Unknown(String),
}

impl ServerMessage {
    /// Classify a decoded message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidMessage`] when a known method carries
    /// parameters of the wrong shape.
    pub fn parse(message: Message) -> Result<Self, CodecError> {
        let Message { method, params } = message;
        let session = || required_str(&method, &params, 0);

        let parsed = match method.as_str() {
            "qsd" => {
                let payload = params
                    .get(1)
                    .cloned()
                    .ok_or_else(|| invalid(&method, "missing quote payload"))?;
                let data: QuoteData = serde_json::from_value(payload)
                    .map_err(|e| invalid(&method, &e.to_string()))?;
                Self::Quote {
                    session: session()?,
                    data,
                }
            }
            "timescale_update" | "du" => Self::Series(parse_series(&method, &params)?),
            "quote_completed" => Self::Ack(Ack::QuoteCompleted {
                session: session()?,
                symbol: required_str(&method, &params, 1)?,
            }),
            "symbol_resolved" => Self::Ack(Ack::SymbolResolved { session: session()? }),
            "series_completed" => Self::Ack(Ack::SeriesCompleted { session: session()? }),
            "study_loading" => Self::Ack(Ack::StudyLoading {
                session: session()?,
                study_id: required_str(&method, &params, 1)?,
            }),
            "study_completed" => Self::Ack(Ack::StudyCompleted {
                session: session()?,
                study_id: required_str(&method, &params, 1)?,
            }),
            "series_error" => Self::Error(ServerError::Series {
                session: session()?,
                detail: detail(&params, 1),
            }),
            "symbol_error" => Self::Error(ServerError::Symbol {
                session: session()?,
                detail: detail(&params, 1),
            }),
            "study_error" => Self::Error(ServerError::Study {
                session: session()?,
                study_id: required_str(&method, &params, 1)?,
                detail: detail(&params, 2),
            }),
            "critical_error" => Self::Error(ServerError::Critical {
                detail: detail(&params, 0),
            }),
            "protocol_error" => Self::Error(ServerError::Protocol {
                detail: detail(&params, 0),
            }),
            _ => Self::Unknown(method.clone()),
        };
        Ok(parsed)
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Quote { .. } => "quote",
            Self::Series(_) => "series",
            Self::Ack(_) => "ack",
            Self::Error(_) => "error",
            Self::Unknown(_) => "unknown",
        }
    }
}

fn invalid(method: &str, reason: &str) -> CodecError {
    CodecError::InvalidMessage(format!("{method}: {reason}"))
}

fn required_str(method: &str, params: &[Value], index: usize) -> Result<String, CodecError> {
    params
        .get(index)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| invalid(method, &format!("parameter {index} is not a string")))
}

/// Remaining parameters rendered for logs.
fn detail(params: &[Value], from: usize) -> String {
    params
        .get(from..)
        .unwrap_or_default()
        .iter()
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_series(method: &str, params: &[Value]) -> Result<SeriesData, CodecError> {
    let session = required_str(method, params, 0)?;
    let Some(Value::Object(blocks)) = params.get(1) else {
        return Err(invalid(method, "missing series payload"));
    };

    let mut bars = Vec::new();
    let mut studies = Vec::new();

    for (series, block) in blocks {
        let is_prices = series == PRICE_SERIES;
        let is_study = series.starts_with("st");
        if !is_prices && !is_study {
            continue;
        }
        let block: SeriesBlock = serde_json::from_value(block.clone()).unwrap_or_default();

        if is_prices {
            bars.extend(block.s.iter().filter_map(|row| Candle::from_row(&row.v)));
        } else if let Some(latest) = block.st.last().or_else(|| block.s.last()) {
            if latest.v.len() >= 2 {
                studies.push(StudyRow {
                    study_id: series.clone(),
                    row: latest.v.clone(),
                });
            }
        }
    }

    Ok(SeriesData {
        session,
        bars,
        studies,
    })
}
