//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports, plus the ambient
//! configuration, telemetry and health plumbing.

/// TradingView WebSocket adapter: codec, dispatcher, connection manager.
pub mod tradingview;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
