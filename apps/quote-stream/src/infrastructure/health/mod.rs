//! Health Endpoint
//!
//! Small HTTP surface over a running [`StreamClient`] for orchestrators and
//! scrapers.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON report: connection, reconnects, subscriptions
//! - `GET /healthz` - liveness, always `OK`
//! - `GET /readyz` - `200` only while the stream is connected
//! - `GET /subscriptions` - subscribed symbols and charts
//! - `GET /metrics` - Prometheus text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::SubscriptionCounts;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::tradingview::{ConnectionState, ConnectionStatus, StreamClient};

// =============================================================================
// Report
// =============================================================================

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Daemon version.
    pub version: String,
    /// Seconds since the daemon started.
    pub uptime_secs: u64,
    /// When the report was built.
    pub current_time: DateTime<Utc>,
    /// Stream connection.
    pub connection: ConnectionReport,
    /// Subscriptions by kind.
    pub subscriptions: SubscriptionCounts,
}

/// Verdict derived from the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Data is flowing.
    Healthy,
    /// Working towards a connection.
    Degraded,
    /// Given up or closed.
    Unhealthy,
}

impl From<ConnectionState> for HealthStatus {
    fn from(state: ConnectionState) -> Self {
        if state == ConnectionState::Connected {
            Self::Healthy
        } else if state.is_transitional() {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

/// Connection part of the report.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Reconnect attempt in progress.
    pub attempt: u32,
    /// Reconnect attempts since start.
    pub reconnects: u64,
    /// Most recent connection error, if any.
    pub last_error: Option<String>,
}

impl ConnectionReport {
    fn new(status: ConnectionStatus, reconnects: u64) -> Self {
        Self {
            state: status.state,
            attempt: status.attempt,
            reconnects,
            last_error: status.last_error.map(|e| e.to_string()),
        }
    }
}

/// Body of `GET /subscriptions`.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionReport {
    /// Quote symbols.
    pub symbols: Vec<String>,
    /// Charts as `SYMBOL:interval`.
    pub charts: Vec<String>,
}

// =============================================================================
// Server State
// =============================================================================

/// What the handlers read from.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    client: StreamClient,
}

impl HealthServerState {
    /// State for `client`, reporting `version`.
    #[must_use]
    pub fn new(version: String, client: StreamClient) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            client,
        }
    }

    /// Snapshot for `GET /health`.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let status = self.client.status();
        HealthReport {
            status: status.state.into(),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            connection: ConnectionReport::new(status, self.client.reconnect_count()),
            subscriptions: self.client.subscription_counts(),
        }
    }

    /// Snapshot for `GET /subscriptions`.
    #[must_use]
    pub fn subscriptions(&self) -> SubscriptionReport {
        SubscriptionReport {
            symbols: self.client.subscribed_symbols(),
            charts: self
                .client
                .chart_subscriptions()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Health HTTP server, stopped by its cancellation token.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Server on `0.0.0.0:port`.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    fn router(state: Arc<HealthServerState>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/healthz", get(|| async { "OK" }))
            .route("/readyz", get(readiness))
            .route("/subscriptions", get(subscriptions))
            .route("/metrics", get(prometheus))
            .with_state(state)
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// [`HealthServerError::Bind`] if the port is taken,
    /// [`HealthServerError::Serve`] if serving fails.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::Bind {
                port: self.port,
                reason: e.to_string(),
            })?;
        tracing::info!(port = self.port, "health server listening");

        axum::serve(listener, Self::router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::Serve(e.to_string()))?;

        tracing::info!("health server stopped");
        Ok(())
    }
}

async fn health(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let report = state.report();
    let code = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

async fn readiness(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let current = state.client.status().state;
    if current == ConnectionState::Connected {
        (StatusCode::OK, current.to_string())
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, current.to_string())
    }
}

async fn subscriptions(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    Json(state.subscriptions())
}

async fn prometheus() -> impl IntoResponse {
    match get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

/// Health server failures.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// The listen port could not be bound.
    #[error("failed to bind health port {port}: {reason}")]
    Bind {
        /// Requested port.
        port: u16,
        /// OS error.
        reason: String,
    },

    /// The server stopped with an error.
    #[error("health server failed: {0}")]
    Serve(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::StreamConfig;
    use test_case::test_case;

    #[test_case(ConnectionState::Connected, HealthStatus::Healthy)]
    #[test_case(ConnectionState::Connecting, HealthStatus::Degraded)]
    #[test_case(ConnectionState::Handshaking, HealthStatus::Degraded)]
    #[test_case(ConnectionState::Reconnecting, HealthStatus::Degraded)]
    #[test_case(ConnectionState::Disconnected, HealthStatus::Unhealthy)]
    #[test_case(ConnectionState::Closed, HealthStatus::Unhealthy)]
    fn verdict_follows_connection_state(state: ConnectionState, expected: HealthStatus) {
        assert_eq!(HealthStatus::from(state), expected);
    }

    fn state() -> HealthServerState {
        let client = StreamClient::from_config(StreamConfig::default()).unwrap();
        HealthServerState::new("0.1.0".to_string(), client)
    }

    #[test]
    fn idle_client_is_unhealthy() {
        let report = state().report();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.subscriptions, SubscriptionCounts::default());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["connection"]["state"], "disconnected");
        assert_eq!(json["connection"]["last_error"], serde_json::Value::Null);
        assert_eq!(json["version"], "0.1.0");
    }

    #[test]
    fn subscriptions_list_intent() {
        let state = state();
        state.client.subscribe("thyao").unwrap();
        state.client.subscribe_chart("GARAN", "4h").unwrap();

        let report = state.subscriptions();
        assert_eq!(report.symbols, vec!["THYAO".to_string()]);
        assert_eq!(report.charts, vec!["GARAN:4h".to_string()]);
        assert_eq!(state.report().subscriptions.charts, 1);
    }
}
