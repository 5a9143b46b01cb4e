//! Storage backends for the docrelay update log
//!
//! Each backend implements [`docrelay_core::UpdateStore`]: an append-only
//! log of CRDT update payloads per document, replayed in insertion order on
//! hydration and folded into a single merged delta by compaction.

use docrelay_core::StoreError;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::Update;

#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Fold every decodable delta of a log into one merged update payload.
///
/// Rows that fail to decode are dropped from the merge, matching the skip
/// behavior of hydration replay. Errors only when nothing decodes.
pub(crate) fn merge_log(rows: &[Vec<u8>]) -> Result<Vec<u8>, StoreError> {
    let decoded: Vec<Update> = rows
        .iter()
        .filter_map(|row| Update::decode_v1(row).ok())
        .collect();
    if decoded.is_empty() {
        return Err(StoreError::Corrupt(
            "no decodable update in log".to_string(),
        ));
    }
    Ok(Update::merge_updates(decoded).encode_v1())
}
