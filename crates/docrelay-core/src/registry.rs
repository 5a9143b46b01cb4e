//! Document Registry - process-wide table of live rooms
//!
//! Rooms are created lazily on first access and kept resident for the life
//! of the registry (no eviction in the base design). The registry is an
//! explicit object owned by the server instance, not ambient global state,
//! so tests can run several independent relays in one process.

use crate::name::DocName;
use crate::room::{Room, SERVER_CONN};
use crate::store::{StoreStats, UpdateStore};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Process-wide map from document name to its live room.
pub struct Registry {
    rooms: DashMap<String, Arc<Room>>,
    store: Arc<dyn UpdateStore>,
}

impl Registry {
    pub fn new(store: Arc<dyn UpdateStore>) -> Self {
        Self {
            rooms: DashMap::new(),
            store,
        }
    }

    /// Return the room for a document name, creating and hydrating it on
    /// first access.
    ///
    /// Creation is synchronous so connections attach immediately; hydration
    /// from the update log runs as a spawned task and merges commutatively
    /// into whatever the room has accumulated by then, so early edits are
    /// never lost.
    pub fn get_or_create(&self, name: DocName) -> Arc<Room> {
        let key = name.as_str().to_string();

        let mut created = false;
        let room = self
            .rooms
            .entry(key)
            .or_insert_with(|| {
                created = true;
                Room::new(name, self.store.clone())
            })
            .value()
            .clone();

        if created {
            info!(doc = %room.name(), "Opened document");
            let store = self.store.clone();
            let room_for_hydration = room.clone();
            tokio::spawn(async move {
                match store.load(room_for_hydration.name()).await {
                    Ok(updates) if updates.is_empty() => {
                        room_for_hydration.mark_hydrated();
                    }
                    Ok(updates) => {
                        room_for_hydration.hydrate(&updates);
                    }
                    Err(e) => {
                        // Start from empty; a later log replay converges
                        // without data loss thanks to commutative merge.
                        warn!(doc = %room_for_hydration.name(), error = %e,
                              "Hydration failed, starting empty");
                        room_for_hydration.mark_hydrated();
                    }
                }
            });
        }

        room
    }

    /// Look up an existing room without creating one.
    pub fn get(&self, name: &DocName) -> Option<Arc<Room>> {
        self.rooms.get(name.as_str()).map(|r| r.value().clone())
    }

    /// Drop presence entries idle past `timeout` in every room, broadcasting
    /// the removals. Returns the number of entries removed.
    pub fn sweep_presence(&self, timeout: Duration) -> usize {
        let mut removed = 0;
        for entry in self.rooms.iter() {
            let room = entry.value();
            if let Some(removal) = room.sweep_presence(timeout) {
                removed += removal.clients.len();
                room.broadcast(SERVER_CONN, docrelay_protocol::awareness(removal));
            }
        }
        if removed > 0 {
            debug!(removed, "Swept idle presence entries");
        }
        removed
    }

    /// Compact the update log of every room whose pending append count has
    /// reached `min_appended`. Returns the number of rooms compacted.
    pub async fn compact(&self, min_appended: usize) -> usize {
        let candidates: Vec<Arc<Room>> = self
            .rooms
            .iter()
            .filter(|e| e.value().appended_since_compaction() >= min_appended)
            .map(|e| e.value().clone())
            .collect();

        let mut compacted = 0;
        for room in candidates {
            match room.compact().await {
                Ok(removed) if removed > 0 => compacted += 1,
                _ => {}
            }
        }
        compacted
    }

    /// Registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let mut connection_count = 0;
        let mut presence_count = 0;
        for entry in self.rooms.iter() {
            connection_count += entry.value().connection_count();
            presence_count += entry.value().presence_count();
        }
        RegistryStats {
            room_count: self.rooms.len(),
            connection_count,
            presence_count,
        }
    }

    /// Storage statistics from the backing update store.
    pub async fn store_stats(&self) -> Result<StoreStats, crate::store::StoreError> {
        self.store.stats().await
    }

    // --- read-only collaborator seams ------------------------------------

    /// All (file name, content) pairs of a document, for the metadata-save
    /// export and the code execution proxy. `None` if the document is not
    /// open in this process.
    pub fn export_files(&self, name: &DocName) -> Option<Vec<(String, String)>> {
        self.get(name).map(|room| room.export_files())
    }

    /// Up to `max_chars` of one file's content, for AI prompt context.
    pub fn text_excerpt(&self, name: &DocName, file: &str, max_chars: usize) -> Option<String> {
        let text = self.get(name)?.file_text(file)?;
        if text.chars().count() <= max_chars {
            Some(text)
        } else {
            Some(text.chars().take(max_chars).collect())
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("rooms", &self.rooms.len())
            .finish()
    }
}

/// Registry statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub room_count: usize,
    pub connection_count: usize,
    pub presence_count: usize,
}
