//! Configuration Module
//!
//! Configuration loading for the streaming client and its daemon.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_BAR_COUNT, DEFAULT_EXCHANGE, DEFAULT_ORIGIN, DEFAULT_URL,
    DEFAULT_WORKER_CAPACITY, DaemonSettings, OfflinePolicy, StreamConfig,
};
