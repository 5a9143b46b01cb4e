//! Ephemeral presence (awareness) tracking
//!
//! Tracks per-connection metadata (display name, color, cursor) independent
//! of document content. Entries merge last-write-wins on the logical clock
//! carried in the awareness encoding; `yrs::sync::Awareness` owns that
//! merge. Nothing in here is ever persisted.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use yrs::block::ClientID;
use yrs::sync::{Awareness, AwarenessUpdate};
use yrs::Doc;

/// Per-document table of ephemeral client states.
pub struct PresenceTable {
    awareness: Awareness,
    /// Arrival time of the most recent update per client, for the
    /// inactivity sweep. Abrupt network loss never produces an explicit
    /// removal, so idle entries are reclaimed by timeout instead.
    last_seen: HashMap<ClientID, Instant>,
}

impl PresenceTable {
    pub fn new() -> Self {
        // The awareness instance needs a doc for its own (unused) local
        // client identity; the server never publishes local state.
        Self {
            awareness: Awareness::new(Doc::new()),
            last_seen: HashMap::new(),
        }
    }

    /// Merge an incoming awareness update.
    ///
    /// Returns the client ids the update mentioned, so the owning session
    /// can track which entries to clear on disconnect.
    pub fn apply(&mut self, update: AwarenessUpdate) -> Result<Vec<ClientID>> {
        let mentioned: Vec<ClientID> = update.clients.keys().copied().collect();
        self.awareness
            .apply_update(update)
            .map_err(|e| Error::Presence(e.to_string()))?;

        let now = Instant::now();
        for id in &mentioned {
            if self.awareness.clients().contains_key(id) {
                self.last_seen.insert(*id, now);
            } else {
                // The update itself was a removal
                self.last_seen.remove(id);
            }
        }
        Ok(mentioned)
    }

    /// Encoded state of every present client, or `None` when empty.
    ///
    /// Sent once to each newly joined connection.
    pub fn full_state(&self) -> Option<AwarenessUpdate> {
        if self.awareness.clients().is_empty() {
            return None;
        }
        self.awareness.update().ok()
    }

    /// Remove the given clients, returning the removal update to broadcast.
    ///
    /// The returned update carries a null state with a bumped clock per
    /// client, so remaining peers clear their stale cursors.
    pub fn remove(&mut self, clients: &[ClientID]) -> Option<AwarenessUpdate> {
        let present: Vec<ClientID> = clients
            .iter()
            .copied()
            .filter(|id| self.awareness.clients().contains_key(id))
            .collect();
        if present.is_empty() {
            return None;
        }

        for id in &present {
            self.awareness.remove_state(*id);
            self.last_seen.remove(id);
        }
        self.awareness.update_with_clients(present).ok()
    }

    /// Remove every client not refreshed within `timeout`.
    pub fn sweep(&mut self, timeout: Duration) -> Option<AwarenessUpdate> {
        let now = Instant::now();
        let idle: Vec<ClientID> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        self.remove(&idle)
    }

    /// Current JSON state for one client, if present.
    pub fn state_of(&self, client: ClientID) -> Option<&str> {
        self.awareness.clients().get(&client).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.awareness.clients().is_empty()
    }

    pub fn len(&self) -> usize {
        self.awareness.clients().len()
    }
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PresenceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTable")
            .field("clients", &self.len())
            .finish()
    }
}
