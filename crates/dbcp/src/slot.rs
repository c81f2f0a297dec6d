//! Statement slots shared between the cache and statement proxies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::Result;
use crate::statement::Statement;

/// Availability of a cache-managed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Resident in the cache and free for the next lookup.
    Available = 0,
    /// Resident in the cache and owned by exactly one proxy.
    InUse = 1,
    /// Removed from the cache. Whoever holds it last performs the real close.
    Evicted = 2,
}

impl SlotState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Available,
            1 => Self::InUse,
            _ => Self::Evicted,
        }
    }
}

/// One raw statement plus its availability state.
///
/// A slot without state is not cache-managed: its statement is really
/// closed when the owning proxy is closed.
pub struct StatementSlot<S> {
    statement: Arc<S>,
    state: Option<AtomicU8>,
}

impl<S> StatementSlot<S> {
    /// A cache-managed slot, in use by its creator.
    pub fn cached(statement: Arc<S>) -> Self {
        Self {
            statement,
            state: Some(AtomicU8::new(SlotState::InUse as u8)),
        }
    }

    /// A slot that is not managed by any cache.
    pub fn unmanaged(statement: Arc<S>) -> Self {
        Self {
            statement,
            state: None,
        }
    }

    /// The raw statement.
    pub fn statement(&self) -> &Arc<S> {
        &self.statement
    }

    /// Current state, `None` for unmanaged slots.
    pub fn state(&self) -> Option<SlotState> {
        self.state
            .as_ref()
            .map(|s| SlotState::from_u8(s.load(Ordering::SeqCst)))
    }

    /// Whether the slot was created by a cache.
    pub fn is_cache_managed(&self) -> bool {
        self.state.is_some()
    }

    /// `Available -> InUse`. Exactly one concurrent caller succeeds.
    pub(crate) fn try_take(&self) -> bool {
        self.transition(SlotState::Available, SlotState::InUse)
    }

    /// `InUse -> Available`. Fails for evicted and unmanaged slots.
    pub(crate) fn try_release(&self) -> bool {
        self.transition(SlotState::InUse, SlotState::Available)
    }

    /// Mark the slot as removed from the cache, returning the previous state.
    pub(crate) fn evict(&self) -> Option<SlotState> {
        self.state
            .as_ref()
            .map(|s| SlotState::from_u8(s.swap(SlotState::Evicted as u8, Ordering::SeqCst)))
    }

    fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state.as_ref().is_some_and(|s| {
            s.compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        })
    }
}

impl<S> std::fmt::Debug for StatementSlot<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementSlot")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A slot removed from the cache, awaiting destruction.
#[derive(Debug)]
pub struct Evicted<S> {
    slot: Arc<StatementSlot<S>>,
    previous: Option<SlotState>,
}

impl<S> Evicted<S> {
    pub(crate) fn new(slot: Arc<StatementSlot<S>>, previous: Option<SlotState>) -> Self {
        Self { slot, previous }
    }

    /// The removed slot.
    pub fn slot(&self) -> &Arc<StatementSlot<S>> {
        &self.slot
    }

    /// Whether nobody owned the statement at removal time.
    ///
    /// An in-use statement is closed by its proxy instead.
    pub fn was_available(&self) -> bool {
        self.previous == Some(SlotState::Available)
    }
}

impl<S: Statement> Evicted<S> {
    /// Close the raw statement if nobody owned it at removal time.
    ///
    /// Returns whether the real close ran.
    pub async fn destroy(self) -> Result<bool> {
        if !self.was_available() {
            return Ok(false);
        }
        self.slot.statement.close().await?;
        Ok(true)
    }
}
