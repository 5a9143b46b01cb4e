//! Docrelay wire protocol
//!
//! Every frame on the wire is a y-protocol v1 message: a varuint message
//! type followed by a type-specific payload.
//!
//! ```text
//! SYNC      (0)  inner sync-message-type, then state vector or update bytes
//! AWARENESS (1)  varuint-prefixed awareness update for one or more clients
//! ```
//!
//! Encoding and decoding are delegated to `yrs::sync::Message`, which turns
//! the raw tag dispatch into an exhaustive enum. This crate adds the frame
//! size limit and the small set of encoders the relay actually emits.

pub mod error;
pub mod frame;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    awareness, awareness_query, decode, is_noop_update, sync_step1, sync_step2, sync_update,
    MAX_FRAME_SIZE,
};

pub use yrs::sync::{AwarenessUpdate, Message, SyncMessage};
