#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::default_trait_access
    )
)]

//! Quote Stream - Real-Time Market Data Client
//!
//! A client that keeps one persistent WebSocket connection to the
//! TradingView quote/chart service and multiplexes quote, candle and study
//! subscriptions over it. The latest value per subscribed key is cached;
//! consumers read snapshots, register callbacks, or wait for the next
//! update with a deadline.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: state with no I/O
//!   - `market`: symbols, intervals, quotes, candles, study keys and values
//!   - `cache`: latest quote, bounded candle series and study output
//!   - `subscription`: desired subscriptions, replayed on reconnect
//!   - `session`: per-connection quote/chart session index
//!
//! - **Application**: ports and shared services
//!   - `ports`: transport, symbol resolution and credential interfaces
//!   - `services`: the shared state lock, callbacks and waiters
//!
//! - **Infrastructure**: adapters
//!   - `tradingview`: codec, dispatcher, connection manager, client
//!   - `config`, `telemetry`, `metrics`, `health`
//!
//! # Data Flow
//!
//! ```text
//!                    ┌──────────────┐   ┌────────────┐   ┌──────────────┐
//! WebSocket ───────► │ FrameDecoder │──►│ dispatch() │──►│ CacheStore   │
//!                    └──────────────┘   └─────┬──────┘   └──────────────┘
//!                                             │ deliveries (outside lock)
//!                                             ▼
//!                                   callbacks / wait_for_*
//!
//! subscribe() ──► SubscriptionTable ──► CommandPlanner ──► command queue ──► WebSocket
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Streaming state with no I/O.
pub mod domain;

/// Application layer - Ports and shared services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{
    Candle, ChartKey, Indicator, Interval, Quote, StudyKey, StudyParams, StudyValues, Symbol,
};
pub use domain::subscription::{SubscriptionCounts, SubscriptionError};

// Ports
pub use application::ports::{
    Connector, Credential, CredentialProvider, ExchangeResolver, SymbolResolver, Transport,
    TransportError,
};
pub use application::services::CallbackId;

// Client
pub use infrastructure::tradingview::{
    ConnectionState, ConnectionStatus, DispatchMode, HeartbeatConfig, ReconnectConfig,
    StreamClient, StreamError, WebSocketConnector,
};

// Configuration
pub use infrastructure::config::{ConfigError, DaemonSettings, OfflinePolicy, StreamConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
