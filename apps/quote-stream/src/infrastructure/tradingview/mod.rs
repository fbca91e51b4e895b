//! TradingView Streaming Adapter
//!
//! Everything that speaks the quote/chart WebSocket protocol:
//!
//! - **codec / messages**: `~m~` framing, command builders, inbound
//!   message classification
//! - **commands**: subscription intent to wire commands
//! - **dispatcher**: inbound messages to cache, callbacks and waiters
//! - **connection / client**: connection manager and consumer API
//! - **heartbeat / reconnect / transport / auth**: the plumbing around them

pub mod auth;
pub mod client;
pub mod codec;
pub mod commands;
mod connection;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod transport;

pub use auth::{AUTH_TOKEN_ENV, Anonymous, EnvToken, StaticToken};
pub use client::StreamClient;
pub use codec::{CodecError, Frame, FrameDecoder, Message};
pub use commands::CommandPlanner;
pub use connection::{ConnectionState, ConnectionStatus};
pub use dispatcher::{DispatchMode, Dispatched, dispatch};
pub use error::StreamError;
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use messages::ServerMessage;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use transport::WebSocketConnector;
