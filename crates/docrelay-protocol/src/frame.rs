//! Frame encoding and decoding
//!
//! The relay never constructs sync messages by hand; it wraps the payloads
//! produced by the replica (state vectors, update deltas) into
//! `yrs::sync::Message` variants and lets yrs do the lib0 encoding.

use crate::error::{ProtocolError, ProtocolResult};
use yrs::sync::{AwarenessUpdate, Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

/// Maximum accepted frame size in bytes (10 MiB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Decode a single wire frame into a typed message.
///
/// Dispatch happens on the decoded variant, never on the raw tag byte, so a
/// frame with an unknown type decodes to `Message::Custom` rather than
/// tearing down the connection.
pub fn decode(data: &[u8]) -> ProtocolResult<Message> {
    if data.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Message::decode_v1(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode a Sync-Step-1 frame carrying this replica's state vector.
pub fn sync_step1(sv: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(sv)).encode_v1()
}

/// Encode a Sync-Step-2 frame carrying the delta a peer is missing.
pub fn sync_step2(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(update)).encode_v1()
}

/// Encode an ongoing update frame.
pub fn sync_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

/// Encode an awareness frame.
pub fn awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

/// Encode a request for a peer's full awareness state.
pub fn awareness_query() -> Vec<u8> {
    Message::AwarenessQuery.encode_v1()
}

/// True if an update delta carries no operations.
///
/// A v1 update with zero structs and an empty delete set encodes as exactly
/// two zero bytes; replying to Sync-Step-1 with it would be a no-op frame.
pub fn is_noop_update(update: &[u8]) -> bool {
    update == [0u8, 0u8]
}
