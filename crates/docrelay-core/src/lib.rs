//! Docrelay Core - CRDT replicas and document rooms
//!
//! This crate provides the in-memory half of the relay:
//! - Document naming and the process-wide registry
//! - The yrs-backed CRDT replica for each document
//! - Ephemeral presence (awareness) tracking
//! - The `UpdateStore` seam that persistence backends implement

pub mod error;
pub mod name;
pub mod presence;
pub mod registry;
pub mod replica;
pub mod room;
pub mod store;

pub use error::{Error, Result};
pub use name::DocName;
pub use presence::PresenceTable;
pub use registry::{Registry, RegistryStats};
pub use replica::Replica;
pub use room::{ConnId, Frame, Room, SERVER_CONN};
pub use store::{StoreError, StoreStats, UpdateStore};
