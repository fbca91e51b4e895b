//! Application Layer - Ports and shared services.
//!
//! Collaborator interfaces the core consumes and the state shared between
//! consumer calls and the read loop.

/// Port interfaces for the transport, symbol resolution and credentials.
pub mod ports;

/// Shared state, callbacks and waiters.
pub mod services;
