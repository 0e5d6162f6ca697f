//! Striped record locks.
//!
//! Read-modify-write sequences on a single conversation (or on a single
//! participant pair) must not interleave. Instead of one global lock the
//! store hashes the record key onto a fixed set of stripes, so unrelated
//! conversations almost never contend.
//!
//! The guards are passed *into* the store's write methods, which makes
//! "hold the lock while writing" a compile-time requirement.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::records::PairKey;

/// Default number of stripes per lock table.
pub const DEFAULT_STRIPES: usize = 64;

/// A fixed table of mutexes indexed by key hash.
pub struct LockStripes {
    stripes: Vec<Mutex<()>>,
}

impl LockStripes {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock<K: Hash>(&self, key: &K) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        // The mutex guards no data, so a poisoned stripe is still usable.
        self.stripes[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the stripe owning `conversation_id`.
    pub fn conversation(&self, conversation_id: Uuid) -> ConversationGuard<'_> {
        ConversationGuard {
            conversation_id,
            _guard: self.lock(&conversation_id),
        }
    }

    /// Lock the stripe owning `pair`.
    pub fn pair(&self, pair: PairKey) -> PairGuard<'_> {
        PairGuard {
            pair,
            _guard: self.lock(&pair),
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}

/// Proof that the caller holds the write lock for one conversation.
pub struct ConversationGuard<'a> {
    conversation_id: Uuid,
    _guard: MutexGuard<'a, ()>,
}

impl ConversationGuard<'_> {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }
}

/// Proof that the caller holds the create lock for one participant pair.
pub struct PairGuard<'a> {
    pair: PairKey,
    _guard: MutexGuard<'a, ()>,
}

impl PairGuard<'_> {
    pub fn pair(&self) -> PairKey {
        self.pair
    }
}
