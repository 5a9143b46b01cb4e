//! WebSocket transport for docrelay
//!
//! Accepts y-protocol WebSocket connections, runs the sync handshake, and
//! relays update and awareness frames between peers of the same document.

pub mod server;
pub mod session;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use server::RelayServer;
pub use session::SyncSession;

#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsServer};
