//! In-process coalescing of concurrent conversions for the same key.
//!
//! The first request for a key becomes the [`Leader`] and owns the
//! conversion; every request for that key arriving while the Leader is in
//! flight becomes a [`Follower`] and waits for the Leader's outcome instead
//! of starting its own. The table is held only for the map operation itself,
//! never across a conversion.
//!
//! ```text
//! claim(k) ──▶ slot free? ──yes──▶ Leader ── convert ── publish ── release(outcome)
//!                 │                                                   │
//!                 no                                                  ▼
//!                 └──────────────▶ Follower ── wait() ◀──── outcome broadcast
//! ```
//!
//! A Leader dropped without [`Leader::release`] (a panic, a cancelled task)
//! still frees the slot; its Followers then observe an `Internal` failure
//! rather than waiting forever.

use crate::cache::Served;
use crate::error::ConversionFailure;
use crate::key::ContentAddress;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, warn};

/// What every participant in one coalesced conversion receives. `cached`
/// tells whether the Leader found the entry already published instead of
/// converting it.
pub type Outcome = Result<Served, ConversionFailure>;

type Slots = HashMap<ContentAddress, Slot>;

struct Slot {
    id: u64,
    outcome: watch::Receiver<Option<Outcome>>,
}

/// Map of keys with a conversion currently in flight.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct InflightTable {
    slots: Arc<Mutex<Slots>>,
    next_id: Arc<AtomicU64>,
}

/// Result of [`InflightTable::claim`].
pub enum Role {
    Leader(Leader),
    Follower(Follower),
}

impl InflightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the Leader for `key`, or join the Leader already in flight.
    pub fn claim(&self, key: &ContentAddress) -> Role {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get(key) {
            debug!(key = %key, "Joining in-flight conversion");
            return Role::Follower(Follower {
                outcome: slot.outcome.clone(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        slots.insert(key.clone(), Slot { id, outcome: rx });
        debug!(key = %key, "Leading new conversion");
        Role::Leader(Leader {
            slots: Arc::clone(&self.slots),
            key: key.clone(),
            id,
            tx,
        })
    }

    /// Number of keys currently being converted.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &ContentAddress) -> bool {
        lock(&self.slots).contains_key(key)
    }
}

impl std::fmt::Debug for InflightTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightTable")
            .field("in_flight", &self.len())
            .finish()
    }
}

/// Exclusive owner of one key's conversion.
pub struct Leader {
    slots: Arc<Mutex<Slots>>,
    key: ContentAddress,
    id: u64,
    tx: watch::Sender<Option<Outcome>>,
}

impl Leader {
    pub fn key(&self) -> &ContentAddress {
        &self.key
    }

    /// A Follower handle on this Leader's own outcome, for the request that
    /// hands the work off to a background task.
    pub fn subscribe(&self) -> Follower {
        Follower {
            outcome: self.tx.subscribe(),
        }
    }

    /// Free the key and hand `outcome` to every Follower.
    ///
    /// Call only after a successful result has been published to the store,
    /// so a request arriving after the slot is freed finds the entry there.
    pub fn release(self, outcome: Outcome) {
        self.vacate();
        self.tx.send_replace(Some(outcome));
        // `Drop` runs next; vacating again is a no-op.
    }

    fn vacate(&self) {
        let mut slots = lock(&self.slots);
        // A newer Leader may own the key if this one was already vacated.
        if slots.get(&self.key).is_some_and(|s| s.id == self.id) {
            slots.remove(&self.key);
        }
    }
}

impl Drop for Leader {
    fn drop(&mut self) {
        if self.tx.borrow().is_none() {
            warn!(key = %self.key, "Conversion abandoned before completion");
        }
        self.vacate();
    }
}

/// A waiter on someone else's conversion.
pub struct Follower {
    outcome: watch::Receiver<Option<Outcome>>,
}

impl Follower {
    /// Wait for the Leader's outcome.
    pub async fn wait(mut self) -> Outcome {
        loop {
            let current = self.outcome.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if self.outcome.changed().await.is_err() {
                // Sender gone. Take a value sent just before the drop, if any.
                let last = self.outcome.borrow().clone();
                return last.unwrap_or_else(|| {
                    Err(ConversionFailure::internal("conversion was abandoned"))
                });
            }
        }
    }
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    // The map stays consistent even if a holder panicked mid-insert.
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}
