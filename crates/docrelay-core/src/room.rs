//! Live state for one open document
//!
//! A `Room` bundles what every connection to a document shares: the CRDT
//! replica, the presence table, the broadcast channel that fans frames out
//! to the document's sync sessions, and the persistence handle. Mutation of
//! replica and presence is serialized by per-room mutexes, so deltas applied
//! to one document are totally ordered even under concurrent connections.

use crate::error::Result;
use crate::name::DocName;
use crate::presence::PresenceTable;
use crate::replica::Replica;
use crate::store::UpdateStore;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use yrs::block::ClientID;
use yrs::sync::AwarenessUpdate;
use yrs::StateVector;

/// Identity of one connection within a room.
pub type ConnId = u64;

/// Reserved origin for frames the server itself produces (hydration,
/// presence sweeps). Never assigned to a real connection.
pub const SERVER_CONN: ConnId = 0;

/// Outbound buffer depth per connection. A receiver that falls further
/// behind than this is lagged and gets disconnected by its session.
const BROADCAST_CAPACITY: usize = 1024;

/// A fully-encoded wire message tagged with its originating connection, so
/// receivers can suppress the echo back to the sender.
#[derive(Debug, Clone)]
pub struct Frame {
    pub from: ConnId,
    pub data: Bytes,
}

/// Shared live state for one document name.
pub struct Room {
    name: DocName,
    replica: Mutex<Replica>,
    presence: Mutex<PresenceTable>,
    frames: broadcast::Sender<Frame>,
    store: Arc<dyn UpdateStore>,
    hydrated: AtomicBool,
    /// Deltas appended since the last log compaction.
    appended: AtomicUsize,
}

impl Room {
    pub fn new(name: DocName, store: Arc<dyn UpdateStore>) -> Arc<Self> {
        let (frames, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            name,
            replica: Mutex::new(Replica::new()),
            presence: Mutex::new(PresenceTable::new()),
            frames,
            store,
            hydrated: AtomicBool::new(false),
            appended: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &DocName {
        &self.name
    }

    /// Subscribe to frames broadcast within this room.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.frames.subscribe()
    }

    /// Fan a frame out to every subscribed session.
    ///
    /// Receivers filter on `from`, so the sender never sees its own frame.
    /// A send error only means nobody is listening.
    pub fn broadcast(&self, from: ConnId, data: Vec<u8>) {
        let _ = self.frames.send(Frame {
            from,
            data: Bytes::from(data),
        });
    }

    /// Number of sessions currently attached to the broadcast channel.
    pub fn connection_count(&self) -> usize {
        self.frames.receiver_count()
    }

    // --- replica ---------------------------------------------------------

    pub fn state_vector(&self) -> StateVector {
        self.replica.lock().state_vector()
    }

    pub fn diff_for(&self, since: &StateVector) -> Vec<u8> {
        self.replica.lock().diff(since)
    }

    /// Apply one update delta to the canonical replica.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        self.replica.lock().apply_update(update)
    }

    /// Record a delta in the update log, fire-and-forget.
    ///
    /// Persistence failure is logged and the in-memory relay carries on -
    /// availability is favored over durability here.
    pub fn persist(&self, update: Vec<u8>) {
        self.appended.fetch_add(1, Ordering::Relaxed);
        let store = self.store.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = store.append(&name, &update).await {
                warn!(doc = %name, error = %e, "Failed to persist update");
            }
        });
    }

    /// Replay persisted deltas into the replica.
    ///
    /// Called once per room, asynchronously after creation. Client edits
    /// that raced ahead of hydration merge commutatively; whatever the log
    /// added beyond the live state is broadcast so already-connected peers
    /// converge. A delta that fails to decode is skipped - the rest of the
    /// log still applies.
    pub fn hydrate(&self, updates: &[Vec<u8>]) -> usize {
        let (applied, diff) = {
            let replica = self.replica.lock();
            let before = replica.state_vector();
            let mut applied = 0usize;
            for update in updates {
                match replica.apply_update(update) {
                    Ok(()) => applied += 1,
                    Err(e) => {
                        warn!(doc = %self.name, error = %e, "Skipping corrupt persisted update")
                    }
                }
            }
            debug!(doc = %self.name, applied, "Hydrated from update log");
            let diff = (applied > 0).then(|| replica.diff(&before));
            (applied, diff)
        };
        self.hydrated.store(true, Ordering::Release);

        if let Some(diff) = diff {
            if !docrelay_protocol::is_noop_update(&diff) {
                self.broadcast(SERVER_CONN, docrelay_protocol::sync_update(diff));
            }
        }
        applied
    }

    pub fn mark_hydrated(&self) {
        self.hydrated.store(true, Ordering::Release);
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated.load(Ordering::Acquire)
    }

    /// Deltas appended since the last compaction.
    pub fn appended_since_compaction(&self) -> usize {
        self.appended.load(Ordering::Relaxed)
    }

    /// Fold this room's update log into a single merged delta.
    ///
    /// The merge happens inside the store, over exactly the rows it deletes,
    /// so an append racing the compaction is never lost.
    pub async fn compact(&self) -> Result<usize> {
        match self.store.compact(&self.name).await {
            Ok(removed) => {
                self.appended.store(0, Ordering::Relaxed);
                debug!(doc = %self.name, removed, "Compacted update log");
                Ok(removed)
            }
            Err(e) => {
                warn!(doc = %self.name, error = %e, "Compaction failed");
                // Same stance as persist(): degraded durability, not an outage
                Ok(0)
            }
        }
    }

    // --- presence --------------------------------------------------------

    /// Merge an incoming presence update; returns the mentioned client ids.
    pub fn apply_presence(&self, update: AwarenessUpdate) -> Result<Vec<ClientID>> {
        self.presence.lock().apply(update)
    }

    /// Full presence state for a newly joined connection, if any.
    pub fn presence_state(&self) -> Option<AwarenessUpdate> {
        self.presence.lock().full_state()
    }

    /// Drop the given clients' presence, returning the removal to broadcast.
    pub fn remove_presence(&self, clients: &[ClientID]) -> Option<AwarenessUpdate> {
        self.presence.lock().remove(clients)
    }

    /// Drop presence entries idle past `timeout`.
    pub fn sweep_presence(&self, timeout: Duration) -> Option<AwarenessUpdate> {
        self.presence.lock().sweep(timeout)
    }

    pub fn presence_count(&self) -> usize {
        self.presence.lock().len()
    }

    // --- read-only collaborator seams ------------------------------------

    /// Current (file name, content) pairs, for metadata export and the code
    /// execution proxy.
    pub fn export_files(&self) -> Vec<(String, String)> {
        self.replica.lock().export_files()
    }

    /// Current content of one file, for the AI context side-channel.
    pub fn file_text(&self, file: &str) -> Option<String> {
        self.replica.lock().file_text(file)
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("connections", &self.connection_count())
            .finish()
    }
}
