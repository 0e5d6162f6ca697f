//! Multi-device presence via connection reference counting.
//!
//! A user is online while at least one live connection is open. Each user
//! has a slot (a mutex-guarded count) in the map; the slot lock is held
//! across the count change *and* the durable `isOnline` write, so
//! concurrent connects and disconnects for the same user always apply in
//! a single order and no caller ever sees an intermediate count. Map
//! shards are only locked long enough to fetch or retire a slot, never
//! across a store write, so unrelated users do not wait on each other.
//!
//! The map is process-local and starts empty; nothing here is persisted
//! except the user's `isOnline`/`lastSeenAt` fields. Flags left behind by
//! a previous process are cleared with [`PresenceTracker::recover`].

use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::storage::{ChatStore, StoreError};

/// One user's connection count. A slot whose count dropped to zero has
/// been retired from the map.
type Slot = Arc<Mutex<usize>>;

fn lock(slot: &Slot) -> MutexGuard<'_, usize> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reference-counted presence registry.
pub struct PresenceTracker {
    slots: DashMap<Uuid, Slot>,
    store: Arc<ChatStore>,
}

impl PresenceTracker {
    pub fn new(store: Arc<ChatStore>) -> Self {
        Self {
            slots: DashMap::new(),
            store,
        }
    }

    /// Clear `isOnline` for users a previous process left online.
    ///
    /// Call once at startup, before accepting connections.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let reset = self.store.reset_presence()?;
        if reset > 0 {
            log::info!("Reset {reset} stale online flags");
        }
        Ok(reset)
    }

    /// Count one more connection for `user_id`.
    ///
    /// On the 0→1 transition the user is durably marked online first; if
    /// that write fails the count stays at zero. Returns the new count.
    pub fn acquire(&self, user_id: Uuid) -> Result<usize, StoreError> {
        loop {
            let slot = self.slot(user_id);
            let mut count = lock(&slot);
            if !self.is_current(user_id, &slot) {
                // Retired by a concurrent last release; start over.
                continue;
            }

            if *count == 0 {
                if let Err(e) = self.store.update_presence(user_id, true) {
                    self.retire(user_id, &slot);
                    return Err(e);
                }
                log::info!("User {user_id} online");
            }
            *count += 1;
            return Ok(*count);
        }
    }

    /// Count one connection fewer for `user_id`.
    ///
    /// On the 1→0 transition the slot is retired and the user is durably
    /// marked offline with `lastSeenAt = now`. The slot goes away even when
    /// that write fails, so a later connect retries the online write.
    /// Returns the remaining count.
    pub fn release(&self, user_id: Uuid) -> Result<usize, StoreError> {
        let Some(slot) = self.existing(user_id) else {
            log::warn!("Release for user {user_id} without a matching acquire");
            return Ok(0);
        };
        let mut count = lock(&slot);
        match *count {
            0 => {
                log::warn!("Release for user {user_id} without a matching acquire");
                Ok(0)
            }
            1 => {
                let written = self.store.update_presence(user_id, false);
                *count = 0;
                self.retire(user_id, &slot);
                drop(count);
                written?;
                log::info!("User {user_id} offline");
                Ok(0)
            }
            _ => {
                *count -= 1;
                Ok(*count)
            }
        }
    }

    /// Acquire and return a guard that releases on drop.
    pub fn lease(self: &Arc<Self>, user_id: Uuid) -> Result<PresenceLease, StoreError> {
        self.acquire(user_id)?;
        Ok(PresenceLease {
            tracker: Arc::clone(self),
            user_id,
        })
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connection_count(user_id) > 0
    }

    pub fn connection_count(&self, user_id: Uuid) -> usize {
        self.existing(user_id).map(|slot| *lock(&slot)).unwrap_or(0)
    }

    /// Users with at least one open connection.
    pub fn online_users(&self) -> Vec<Uuid> {
        let slots: Vec<(Uuid, Slot)> = self
            .slots
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        slots
            .into_iter()
            .filter(|(_, slot)| *lock(slot) > 0)
            .map(|(user_id, _)| user_id)
            .collect()
    }

    // Slot locks are never taken while a map reference is alive.

    fn slot(&self, user_id: Uuid) -> Slot {
        Arc::clone(self.slots.entry(user_id).or_default().value())
    }

    fn existing(&self, user_id: Uuid) -> Option<Slot> {
        self.slots.get(&user_id).map(|e| Arc::clone(e.value()))
    }

    fn is_current(&self, user_id: Uuid, slot: &Slot) -> bool {
        self.slots
            .get(&user_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), slot))
    }

    fn retire(&self, user_id: Uuid, slot: &Slot) {
        self.slots.remove_if(&user_id, |_, current| Arc::ptr_eq(current, slot));
    }
}

/// One connection's share of a user's presence.
///
/// Dropping it performs exactly one `release`, whichever way the
/// connection ends.
pub struct PresenceLease {
    tracker: Arc<PresenceTracker>,
    user_id: Uuid,
}

impl PresenceLease {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

impl Drop for PresenceLease {
    fn drop(&mut self) {
        if let Err(e) = self.tracker.release(self.user_id) {
            log::error!("Failed to persist offline state for {}: {e}", self.user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::shared_store;

    #[test]
    fn test_two_connections_one_release() {
        let (_dir, store) = shared_store();
        let user = store.create_user("Alice").unwrap();
        let tracker = PresenceTracker::new(store.clone());

        assert_eq!(tracker.acquire(user.id).unwrap(), 1);
        assert_eq!(tracker.acquire(user.id).unwrap(), 2);
        assert_eq!(tracker.release(user.id).unwrap(), 1);

        assert!(tracker.is_online(user.id));
        assert!(store.load_user(user.id).unwrap().is_online);

        assert_eq!(tracker.release(user.id).unwrap(), 0);
        assert!(!tracker.is_online(user.id));
        let stored = store.load_user(user.id).unwrap();
        assert!(!stored.is_online);
        assert!(stored.last_seen_at.is_some());
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let (_dir, store) = shared_store();
        let tracker = PresenceTracker::new(store);
        assert_eq!(tracker.release(Uuid::new_v4()).unwrap(), 0);
        assert!(tracker.online_users().is_empty());
    }

    #[test]
    fn test_acquire_unknown_user_fails_without_entry() {
        let (_dir, store) = shared_store();
        let tracker = PresenceTracker::new(store);
        let ghost = Uuid::new_v4();
        assert!(tracker.acquire(ghost).is_err());
        assert!(!tracker.is_online(ghost));
        assert_eq!(tracker.connection_count(ghost), 0);
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let (_dir, store) = shared_store();
        let user = store.create_user("Bob").unwrap();
        let tracker = Arc::new(PresenceTracker::new(store.clone()));

        let lease = tracker.lease(user.id).unwrap();
        assert_eq!(lease.user_id(), user.id);
        assert_eq!(tracker.connection_count(user.id), 1);

        drop(lease);
        assert_eq!(tracker.connection_count(user.id), 0);
        assert!(!store.load_user(user.id).unwrap().is_online);
    }

    #[test]
    fn test_concurrent_connections_balance() {
        let (_dir, store) = shared_store();
        let user = store.create_user("Carol").unwrap();
        let tracker = Arc::new(PresenceTracker::new(store.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        tracker.acquire(user.id).unwrap();
                        tracker.release(user.id).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(tracker.connection_count(user.id), 0);
        assert!(!store.load_user(user.id).unwrap().is_online);
        assert!(tracker.online_users().is_empty());
    }

    #[test]
    fn test_slow_store_write_does_not_block_other_users() {
        let (_dir, store) = shared_store();
        let alice = store.create_user("Alice").unwrap();
        let bob = store.create_user("Bob").unwrap();
        let tracker = Arc::new(PresenceTracker::new(store.clone()));
        tracker.acquire(alice.id).unwrap();

        // Hold Alice's slot as an in-flight durable write would.
        let slot = tracker.existing(alice.id).unwrap();
        let held = lock(&slot);

        let other = {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                tracker.acquire(bob.id).unwrap();
                tracker.release(bob.id).unwrap()
            })
        };
        assert_eq!(other.join().unwrap(), 0);
        assert!(!store.load_user(bob.id).unwrap().is_online);

        drop(held);
        assert_eq!(tracker.release(alice.id).unwrap(), 0);
    }

    #[test]
    fn test_recover_resets_flags_from_previous_run() {
        let (_dir, store) = shared_store();
        let user = store.create_user("Dana").unwrap();
        store.update_presence(user.id, true).unwrap();

        let tracker = PresenceTracker::new(store.clone());
        assert_eq!(tracker.recover().unwrap(), 1);
        assert!(!store.load_user(user.id).unwrap().is_online);
        assert!(!tracker.is_online(user.id));
    }
}
