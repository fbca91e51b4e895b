//! Quote Stream Daemon
//!
//! Connects to the streaming service, subscribes to the configured symbols
//! and charts, logs their updates and serves health and metrics.
//!
//! # Usage
//!
//! ```bash
//! QUOTE_STREAM_SYMBOLS=THYAO,GARAN QUOTE_STREAM_CHARTS=THYAO@1h cargo run --bin quote-stream
//! ```
//!
//! # Environment Variables
//!
//! - `QUOTE_STREAM_SYMBOLS`: comma separated quote symbols
//! - `QUOTE_STREAM_CHARTS`: comma separated `SYMBOL@interval` charts
//! - `QUOTE_STREAM_HEALTH_PORT`: health check HTTP port (default: 8083)
//! - `TRADINGVIEW_AUTH_TOKEN`: session token (default: anonymous, delayed data)
//! - `QUOTE_STREAM_*`: client settings, see `StreamConfig::from_env`
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: log filter (default: `quote_stream=info`)

use std::sync::Arc;

use quote_stream::infrastructure::telemetry;
use quote_stream::{
    DaemonSettings, HealthServer, HealthServerState, StreamClient, StreamConfig, init_metrics,
};
use tokio::signal;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting quote stream");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = StreamConfig::from_env()?;
    let settings = DaemonSettings::from_env()?;
    log_config(&config, &settings);

    let shutdown_token = CancellationToken::new();
    let client = StreamClient::from_config(config)?;

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        client.clone(),
    ));
    let health_server = HealthServer::new(
        settings.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Status changes
    let mut statuses = client.status_stream();
    tokio::spawn(async move {
        while let Some(status) = statuses.next().await {
            match &status.last_error {
                Some(error) => tracing::info!(
                    state = %status.state,
                    attempt = status.attempt,
                    error = %error,
                    "connection status"
                ),
                None => tracing::info!(state = %status.state, "connection status"),
            }
        }
    });

    register_loggers(&client);
    subscribe_all(&client, &settings);

    if let Err(e) = client.connect().await {
        tracing::warn!(error = %e, "initial connect failed, retrying in background");
    }

    tracing::info!("Quote stream ready");

    await_shutdown(shutdown_token).await;
    client.disconnect().await;

    tracing::info!("Quote stream stopped");
    Ok(())
}

/// Log every update at debug level.
fn register_loggers(client: &StreamClient) {
    client.on_any_quote(|quote| {
        tracing::debug!(
            symbol = %quote.symbol,
            last = ?quote.last(),
            change_percent = ?quote.change_percent(),
            "quote"
        );
    });
    client.on_any_candle(|key, candle| {
        tracing::debug!(chart = %key, time = candle.time, close = candle.close, "candle");
    });
    client.on_any_study(|key, values| {
        tracing::debug!(study = %key, values = ?values.values, "study");
    });
}

/// Subscribe to the configured symbols and charts. Invalid entries are
/// logged and skipped.
fn subscribe_all(client: &StreamClient, settings: &DaemonSettings) {
    for symbol in &settings.symbols {
        if let Err(e) = client.subscribe(symbol) {
            tracing::warn!(symbol = %symbol, error = %e, "quote subscription rejected");
        }
    }
    for (symbol, interval) in &settings.charts {
        if let Err(e) = client.subscribe_chart(symbol, interval.as_str()) {
            tracing::warn!(symbol = %symbol, interval = %interval, error = %e, "chart subscription rejected");
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig, settings: &DaemonSettings) {
    tracing::info!(
        exchange = %config.default_exchange,
        authenticated = config.auth_token.is_some(),
        dispatch = ?config.dispatch,
        offline_policy = config.offline_policy.as_str(),
        symbols = settings.symbols.len(),
        charts = settings.charts.len(),
        health_port = settings.health_port,
        "Configuration loaded"
    );
    tracing::debug!(url = %config.url, "Stream endpoint");
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
