//! Process-wide table of established connections, keyed by the service instance
//! that owns them.
//!
//! Owners are slots in a generation-checked arena. Retiring an owner frees its
//! slot and drops its entry; a later owner reusing the slot gets a new generation,
//! so stale identifiers never alias a live instance.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ConnectionState, RegistryError, SessionId, Technology, TechnologyKind, TechnologyMap};

/// Identity of a live service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId {
    slot: u32,
    generation: u32,
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    live: bool,
}

#[derive(Debug, Default)]
struct OwnerArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl OwnerArena {
    fn allocate(&mut self) -> OwnerId {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.generation = entry.generation.wrapping_add(1);
            entry.live = true;
            return OwnerId {
                slot,
                generation: entry.generation,
            };
        }

        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            live: true,
        });
        OwnerId { slot, generation: 0 }
    }

    fn is_live(&self, owner: OwnerId) -> bool {
        self.slots
            .get(owner.slot as usize)
            .is_some_and(|slot| slot.live && slot.generation == owner.generation)
    }

    fn release(&mut self, owner: OwnerId) -> bool {
        if !self.is_live(owner) {
            return false;
        }
        self.slots[owner.slot as usize].live = false;
        self.free.push(owner.slot);
        true
    }
}

#[derive(Debug)]
pub struct RegistryEntry {
    pub session_id: SessionId,
    pub technologies: TechnologyMap,
}

/// Entries are written by the coordinator only and are immutable once inserted;
/// lookups from any context see either the whole map or nothing.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<OwnerId, Arc<RegistryEntry>>,
    owners: Mutex<OwnerArena>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_owner(&self) -> OwnerId {
        let owner = self.owners.lock().allocate();
        debug!(%owner, "Owner allocated");
        owner
    }

    pub fn is_live(&self, owner: OwnerId) -> bool {
        self.owners.lock().is_live(owner)
    }

    /// Inserts or replaces the entry of `owner`.
    pub fn register(
        &self,
        owner: OwnerId,
        session_id: SessionId,
        technologies: TechnologyMap,
    ) -> Result<(), RegistryError> {
        if !self.is_live(owner) {
            return Err(RegistryError::OwnerRetired(owner));
        }

        let entry = Arc::new(RegistryEntry {
            session_id,
            technologies,
        });
        if let Some(previous) = self.entries.insert(owner, entry) {
            debug!(%owner, session_id = %previous.session_id, "Registry entry replaced");
        }
        Ok(())
    }

    /// Releases `owner` and drops its entry, returning the session it held.
    pub fn retire(&self, owner: OwnerId) -> Option<SessionId> {
        if !self.owners.lock().release(owner) {
            return None;
        }
        let removed = self.entries.remove(&owner).map(|(_, entry)| entry.session_id.clone());
        info!(%owner, session_id = ?removed.as_ref().map(SessionId::as_str), "Owner retired");
        removed
    }

    /// Drops entries whose owner is no longer live. Returns how many were removed.
    ///
    /// `retire` already drops the entry together with the owner slot, so this is
    /// a backstop for a slot released without its entry and normally finds nothing.
    pub fn reconcile(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|owner, _| self.is_live(*owner));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            info!(removed, "Reclaimed stale registry entries");
        }
        removed
    }

    pub fn resolve(&self, session_id: &SessionId, kind: TechnologyKind) -> Option<Technology> {
        self.find(session_id).map(|entry| entry.technologies.get(kind))
    }

    pub fn state(&self, session_id: &SessionId) -> Option<ConnectionState> {
        self.find(session_id).map(|entry| entry.technologies.state())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn release_slot(&self, owner: OwnerId) -> bool {
        self.owners.lock().release(owner)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, session_id: &SessionId) -> Option<Arc<RegistryEntry>> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.session_id == *session_id)
            .map(|entry| (*entry.key(), entry.value().clone()))?;
        self.is_live(entry.0).then_some(entry.1)
    }
}
