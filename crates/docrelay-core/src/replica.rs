//! In-memory CRDT replica for one document
//!
//! Wraps a `yrs::Doc` and exposes exactly the operations the relay needs:
//! state vectors for the sync handshake, minimal diffs for peers, and
//! commutative update application. Sub-structures (one `Text` per file in
//! the collaborative editor) are yrs root types, so addressing is shared by
//! construction between all participants of a document.

use crate::error::{Error, Result};
use yrs::types::Value;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Resolve a root value to text content.
///
/// Roots integrated from remote deltas carry no local type registration and
/// surface as `UndefinedRef`; peers only create text roots, so those resolve
/// to text too.
fn root_text(value: Value) -> Option<TextRef> {
    match value {
        Value::YText(text) => Some(text),
        Value::UndefinedRef(branch) => Some(TextRef::from(branch)),
        _ => None,
    }
}

/// Canonical in-memory state for one document.
///
/// Mutated only by applying binary update deltas; tombstone garbage
/// collection is left at the yrs default (enabled), since the relay never
/// needs per-character attribution once a delta is durably appended.
pub struct Replica {
    doc: Doc,
}

impl Replica {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Compact summary of which deltas this replica has seen.
    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Minimal update bringing a peer with the given state vector up to date.
    pub fn diff(&self, since: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(since)
    }

    /// The full document state as a single update delta.
    pub fn encode_full_state(&self) -> Vec<u8> {
        self.diff(&StateVector::default())
    }

    /// Merge a remote or local delta into the replica.
    ///
    /// Application is idempotent and commutative (CRDT property), so the
    /// caller never deduplicates or orders deltas beyond per-connection
    /// arrival order.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e: yrs::encoding::read::Error| Error::Crdt(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded);
        Ok(())
    }

    /// Names of all text sub-structures currently present.
    pub fn file_names(&self) -> Vec<String> {
        let txn = self.doc.transact();
        txn.root_refs()
            .filter_map(|(name, value)| root_text(value).map(|_| name.to_string()))
            .collect()
    }

    /// Current text of one named sub-structure, if it exists.
    pub fn file_text(&self, name: &str) -> Option<String> {
        let txn = self.doc.transact();
        txn.root_refs().find_map(|(n, value)| {
            if n != name {
                return None;
            }
            root_text(value).map(|text| text.get_string(&txn))
        })
    }

    /// All text sub-structures as (name, content) pairs.
    pub fn export_files(&self) -> Vec<(String, String)> {
        let txn = self.doc.transact();
        txn.root_refs()
            .filter_map(|(name, value)| {
                root_text(value).map(|text| (name.to_string(), text.get_string(&txn)))
            })
            .collect()
    }

    /// Insert text locally and return the delta describing the mutation.
    ///
    /// The relay itself never edits documents; this is the mutation entry
    /// point for embedding tools and tests.
    pub fn insert_text(&self, file: &str, index: u32, chunk: &str) -> Vec<u8> {
        let before = self.state_vector();
        let text = self.doc.get_or_insert_text(file);
        {
            let mut txn = self.doc.transact_mut();
            text.insert(&mut txn, index, chunk);
        }
        self.diff(&before)
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_delta_materializes_text() {
        let source = Replica::new();
        let delta = source.insert_text("index.js", 0, "hello");

        let target = Replica::new();
        target.apply_update(&delta).unwrap();

        assert_eq!(target.file_text("index.js").unwrap(), "hello");
    }

    #[test]
    fn test_idempotent_application() {
        let source = Replica::new();
        let delta = source.insert_text("index.js", 0, "hello");

        let target = Replica::new();
        target.apply_update(&delta).unwrap();
        target.apply_update(&delta).unwrap();

        assert_eq!(target.file_text("index.js").unwrap(), "hello");
    }

    #[test]
    fn test_convergence_any_order() {
        let a = Replica::new();
        let d1 = a.insert_text("index.js", 0, "hello");
        let d2 = a.insert_text("index.js", 5, " world");
        let d3 = a.insert_text("main.py", 0, "print()");

        let forward = Replica::new();
        for d in [&d1, &d2, &d3] {
            forward.apply_update(d).unwrap();
        }

        let reverse = Replica::new();
        for d in [&d3, &d2, &d1] {
            reverse.apply_update(d).unwrap();
        }

        assert_eq!(forward.file_text("index.js"), reverse.file_text("index.js"));
        assert_eq!(forward.file_text("index.js").unwrap(), "hello world");
        assert_eq!(forward.file_text("main.py").unwrap(), "print()");
    }

    #[test]
    fn test_diff_covers_exactly_whats_missing() {
        let server = Replica::new();
        server.insert_text("index.js", 0, "hello");

        // Peer that has nothing gets everything
        let diff = server.encode_full_state();
        let peer = Replica::new();
        peer.apply_update(&diff).unwrap();
        assert_eq!(peer.file_text("index.js").unwrap(), "hello");

        // Peer that is current gets a no-op delta
        let diff = server.diff(&peer.state_vector());
        assert!(docrelay_protocol::is_noop_update(&diff));
    }

    #[test]
    fn test_reads_cover_remotely_created_files() {
        // Every root on the server side arrives via applied deltas, never
        // via a local get_or_insert; reads must still see them.
        let source = Replica::new();
        let d1 = source.insert_text("index.js", 0, "hello");
        let d2 = source.insert_text("main.py", 0, "pass");

        let target = Replica::new();
        target.apply_update(&d1).unwrap();
        target.apply_update(&d2).unwrap();

        let mut names = target.file_names();
        names.sort();
        assert_eq!(names, vec!["index.js", "main.py"]);
        assert_eq!(target.file_text("index.js").unwrap(), "hello");

        let mut files = target.export_files();
        files.sort();
        assert_eq!(
            files,
            vec![
                ("index.js".to_string(), "hello".to_string()),
                ("main.py".to_string(), "pass".to_string()),
            ]
        );
    }

    #[test]
    fn test_apply_rejects_garbage() {
        let replica = Replica::new();
        assert!(replica.apply_update(&[0xff, 0x01, 0x02]).is_err());
    }

    #[test]
    fn test_export_files() {
        let replica = Replica::new();
        replica.insert_text("index.js", 0, "hello");
        replica.insert_text("main.py", 0, "pass");

        let mut names = replica.file_names();
        names.sort();
        assert_eq!(names, vec!["index.js", "main.py"]);

        let mut files = replica.export_files();
        files.sort();
        assert_eq!(
            files,
            vec![
                ("index.js".to_string(), "hello".to_string()),
                ("main.py".to_string(), "pass".to_string()),
            ]
        );
    }
}
