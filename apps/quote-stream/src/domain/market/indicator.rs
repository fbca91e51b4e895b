//! Indicator Normalization
//!
//! Maps consumer indicator names (`rsi`, `BB`, `STD;MACD`) to the script
//! identifiers the study service expects, and study plot columns to output
//! names.

use std::collections::BTreeMap;

use serde_json::Value;

use super::StudyValues;

/// Short names for the built-in indicators.
const STANDARD_INDICATORS: &[(&str, &str)] = &[
    ("RSI", "STD;RSI"),
    ("MACD", "STD;MACD"),
    ("BB", "STD;BB"),
    ("BOLLINGER", "STD;BB"),
    ("EMA", "STD;EMA"),
    ("SMA", "STD;SMA"),
    ("STOCHASTIC", "STD;Stochastic"),
    ("STOCH", "STD;Stochastic"),
    ("ATR", "STD;ATR"),
    ("ADX", "STD;ADX"),
    ("OBV", "STD;OBV"),
    ("VWAP", "STD;VWAP"),
    ("ICHIMOKU", "STD;Ichimoku%Cloud"),
    ("SUPERTREND", "STD;Supertrend"),
    ("PSAR", "STD;Parabolic%SAR"),
    ("CCI", "STD;CCI"),
    ("MFI", "STD;MFI"),
    ("ROC", "STD;ROC"),
    ("WILLIAMS", "STD;Williams%25R"),
    ("CMF", "STD;CMF"),
    ("VOLUME", "STD;Volume"),
];

/// Plot index to output name, per script.
const INDICATOR_OUTPUTS: &[(&str, &[&str])] = &[
    ("STD;RSI", &["value"]),
    ("STD;MACD", &["macd", "signal", "histogram"]),
    ("STD;BB", &["middle", "upper", "lower"]),
    ("STD;EMA", &["value"]),
    ("STD;SMA", &["value"]),
    ("STD;Stochastic", &["k", "d"]),
    ("STD;ATR", &["value"]),
    ("STD;ADX", &["adx", "plus_di", "minus_di"]),
    ("STD;OBV", &["value"]),
    ("STD;VWAP", &["value"]),
    ("STD;CCI", &["value"]),
    ("STD;MFI", &["value"]),
    ("STD;ROC", &["value"]),
    ("STD;CMF", &["value"]),
];

/// A resolved indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indicator {
    name: String,
    script_id: String,
    outputs: &'static [&'static str],
}

impl Indicator {
    /// Resolve a consumer supplied indicator name.
    ///
    /// Known short names map to their script id; names already containing
    /// `;` are taken as script ids; anything else is assumed to be a
    /// built-in (`STD;<name>`).
    #[must_use]
    pub fn resolve(raw: &str) -> Self {
        let raw = raw.trim();
        let upper = raw.to_uppercase();

        let (name, script_id) = if let Some((_, id)) =
            STANDARD_INDICATORS.iter().find(|(short, _)| *short == upper)
        {
            (upper, (*id).to_string())
        } else if let Some((_, display)) = raw.split_once(';') {
            (display.to_uppercase(), raw.to_string())
        } else {
            (upper, format!("STD;{raw}"))
        };

        let outputs = INDICATOR_OUTPUTS
            .iter()
            .find(|(id, _)| *id == script_id)
            .map_or(&[][..], |(_, outputs)| *outputs);

        Self {
            name,
            script_id,
            outputs,
        }
    }

    /// Display name used in study keys (`RSI`, `MACD`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Script identifier sent to the service (`STD;RSI`).
    #[must_use]
    pub fn script_id(&self) -> &str {
        &self.script_id
    }

    /// Named outputs in plot order; empty when the mapping is unknown.
    #[must_use]
    pub const fn outputs(&self) -> &'static [&'static str] {
        self.outputs
    }

    /// Map a `[time, plot_0, plot_1, ...]` row to named outputs.
    ///
    /// Without a known mapping the first plot is exposed as `value`.
    /// Non-numeric plots (gaps) are skipped.
    #[must_use]
    pub fn map_row(&self, row: &[Value]) -> StudyValues {
        #[allow(clippy::cast_possible_truncation)]
        let time = row
            .first()
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)));
        let plots = row.get(1..).unwrap_or_default();

        let mut values = BTreeMap::new();
        if self.outputs.is_empty() {
            if let Some(v) = plots.first().and_then(Value::as_f64) {
                values.insert("value".to_string(), v);
            }
        } else {
            for (name, plot) in self.outputs.iter().zip(plots) {
                if let Some(v) = plot.as_f64() {
                    values.insert((*name).to_string(), v);
                }
            }
        }

        StudyValues { time, values }
    }
}
