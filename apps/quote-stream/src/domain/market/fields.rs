//! Quote field names requested for every quote session.

/// Fields requested with `quote_set_fields`.
pub const QUOTE_FIELDS: &[&str] = &[
    // Price
    "lp",
    "ch",
    "chp",
    "bid",
    "ask",
    "bid_size",
    "ask_size",
    "volume",
    // OHLC
    "open_price",
    "high_price",
    "low_price",
    "prev_close_price",
    // Fundamentals
    "market_cap_basic",
    "price_earnings_ttm",
    "earnings_per_share_basic_ttm",
    "dividends_yield",
    "beta_1_year",
    // 52 week
    "high_52_week",
    "low_52_week",
    // Meta
    "description",
    "type",
    "exchange",
    "currency_code",
    "lp_time",
    "current_session",
    "status",
    "original_name",
    "short_name",
    // Session and pricing
    "open_time",
    "close_time",
    "timezone",
    "regular_market_price",
    "regular_market_change",
    "regular_market_change_percent",
    "pre_market_price",
    "pre_market_change",
    "after_hours_price",
    "after_hours_change",
    "pricescale",
    "minmov",
    "minmove2",
    "fractional",
    "value_unit_id",
];

/// Owned copy of [`QUOTE_FIELDS`].
#[must_use]
pub fn default_quote_fields() -> Vec<String> {
    QUOTE_FIELDS.iter().map(|f| (*f).to_string()).collect()
}
