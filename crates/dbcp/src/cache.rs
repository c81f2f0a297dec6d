//! Concurrent statement cache.
//!
//! Maps a [`StatementKey`] to the [`StatementSlot`] holding the raw statement
//! created for it. The cache only decides which slots are resident and which
//! are available; closing a removed statement is the caller's job (see
//! [`Evicted::destroy`]).

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::key::StatementKey;
use crate::slot::{Evicted, SlotState, StatementSlot};
use crate::statement::Statement;

/// Outcome of [`StatementCache::register`].
#[derive(Debug)]
pub struct Registration<S> {
    slot: Arc<StatementSlot<S>>,
    cached: bool,
    evicted: Option<Evicted<S>>,
}

impl<S> Registration<S> {
    /// Slot to hand to the caller. Unmanaged when the registration lost.
    pub fn slot(&self) -> &Arc<StatementSlot<S>> {
        &self.slot
    }

    /// Whether the statement became cache-resident.
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Split into the slot and the entry evicted to make room, if any.
    pub fn into_parts(self) -> (Arc<StatementSlot<S>>, Option<Evicted<S>>) {
        (self.slot, self.evicted)
    }
}

/// Bounded, concurrent map from statement keys to statement slots.
///
/// `capacity` is a soft bound: concurrent registrations may overshoot it by
/// the number of racing registrants.
pub struct StatementCache<S> {
    entries: DashMap<StatementKey, Arc<StatementSlot<S>>>,
    capacity: usize,
}

impl<S> StatementCache<S> {
    /// Create a cache holding at most `capacity` statements (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: DashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Take an available statement for `key`.
    ///
    /// Returns the slot, now in use, or `None` when the key is absent or its
    /// statement is owned by someone else.
    pub fn try_reuse(&self, key: &StatementKey) -> Option<Arc<StatementSlot<S>>> {
        let slot = Arc::clone(self.entries.get(key)?.value());
        slot.try_take().then_some(slot)
    }

    /// Insert a freshly created statement under `key`, in use by its creator.
    ///
    /// The first registration of a key wins. A losing registration, or one
    /// that finds the cache full of in-use statements, gets back an
    /// unmanaged slot; its statement is really closed when the caller closes
    /// it.
    pub fn register(&self, key: StatementKey, statement: Arc<S>) -> Registration<S> {
        let mut evicted = None;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            evicted = self.evict_one_available();
            if evicted.is_none() {
                return Registration {
                    slot: Arc::new(StatementSlot::unmanaged(statement)),
                    cached: false,
                    evicted: None,
                };
            }
        }

        match self.entries.entry(key) {
            Entry::Occupied(_) => Registration {
                slot: Arc::new(StatementSlot::unmanaged(statement)),
                cached: false,
                evicted,
            },
            Entry::Vacant(vacant) => {
                let slot = Arc::new(StatementSlot::cached(statement));
                vacant.insert(Arc::clone(&slot));
                Registration {
                    slot,
                    cached: true,
                    evicted,
                }
            }
        }
    }

    /// Remove the entry for `key`.
    pub fn remove(&self, key: &StatementKey) -> Option<Evicted<S>> {
        self.entries.remove(key).map(|(_, slot)| Self::evicted(slot))
    }

    /// Remove the first entry whose slot holds `statement`.
    ///
    /// Identity is pointer identity of the shared statement. Not atomic with
    /// concurrent registrations.
    pub fn remove_statement(&self, statement: &Arc<S>) -> Option<Evicted<S>> {
        let (key, slot) = self
            .entries
            .iter()
            .find(|e| Arc::ptr_eq(e.value().statement(), statement))
            .map(|e| (e.key().clone(), Arc::clone(e.value())))?;
        self.remove_slot(&key, &slot)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Vec<Evicted<S>> {
        let keys: Vec<StatementKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Number of resident statements.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no statement is resident.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured maximum number of resident statements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a statement is resident for `key`.
    pub fn contains_key(&self, key: &StatementKey) -> bool {
        self.entries.contains_key(key)
    }

    fn evict_one_available(&self) -> Option<Evicted<S>> {
        let (key, slot) = self
            .entries
            .iter()
            .find(|e| e.value().state() == Some(SlotState::Available))
            .map(|e| (e.key().clone(), Arc::clone(e.value())))?;
        self.remove_slot(&key, &slot)
    }

    fn remove_slot(
        &self,
        key: &StatementKey,
        slot: &Arc<StatementSlot<S>>,
    ) -> Option<Evicted<S>> {
        self.entries
            .remove_if(key, |_, resident| Arc::ptr_eq(resident, slot))
            .map(|(_, slot)| Self::evicted(slot))
    }

    fn evicted(slot: Arc<StatementSlot<S>>) -> Evicted<S> {
        let previous = slot.evict();
        Evicted::new(slot, previous)
    }
}

impl<S: Statement> StatementCache<S> {
    /// Remove every entry and close the statements nobody is using.
    ///
    /// Close failures are logged and do not stop the sweep.
    pub async fn close_all(&self) {
        for evicted in self.clear() {
            if let Err(error) = evicted.destroy().await {
                tracing::warn!(%error, "Failed to close evicted statement");
            }
        }
    }
}

impl<S> std::fmt::Debug for StatementCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
