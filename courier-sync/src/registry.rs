//! Conversation identity for unordered participant pairs.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ChatError;
use crate::storage::{ChatStore, Conversation, PairKey, StoreError};

/// Default number of conversations returned by [`ConversationRegistry::list_for`].
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Resolves, creates and bumps conversations.
pub struct ConversationRegistry {
    store: Arc<ChatStore>,
}

impl ConversationRegistry {
    pub fn new(store: Arc<ChatStore>) -> Self {
        Self { store }
    }

    /// The conversation between `a` and `b`, created on first contact.
    ///
    /// Creation happens under the pair lock with a second lookup, so two
    /// concurrent first contacts for the same pair get the same record.
    pub fn resolve(&self, a: Uuid, b: Uuid) -> Result<Conversation, ChatError> {
        let pair = PairKey::new(a, b)
            .ok_or_else(|| ChatError::validation("Cannot start a conversation with yourself"))?;

        // Fast path: no lock
        if let Some(existing) = self.store.find_conversation(pair)? {
            return Ok(existing);
        }

        let guard = self.store.lock_pair(pair);
        // Double-check after acquiring the pair lock
        if let Some(existing) = self.store.find_conversation(pair)? {
            return Ok(existing);
        }

        let conversation = Conversation::new(pair, self.store.now());
        self.store.insert_conversation(&guard, &conversation)?;
        log::info!("Conversation {} created for {a} and {b}", conversation.id);
        Ok(conversation)
    }

    /// Bump `lastMessageAt` to now.
    pub fn touch(&self, conversation_id: Uuid) -> Result<Conversation, ChatError> {
        let guard = self.store.lock_conversation(conversation_id);
        let at = self.store.now();
        Ok(self.store.touch_conversation(&guard, at)?)
    }

    pub fn get(&self, conversation_id: Uuid) -> Result<Conversation, ChatError> {
        self.store.load_conversation(conversation_id).map_err(|e| match e {
            StoreError::NotFound(_) => ChatError::not_found("Conversation not found"),
            other => other.into(),
        })
    }

    /// The conversation, only if `user_id` participates in it.
    ///
    /// Non-participants get the same answer as for a missing conversation.
    pub fn for_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Conversation, ChatError> {
        let conversation = self.get(conversation_id)?;
        if !conversation.has_participant(user_id) {
            return Err(ChatError::not_found("Conversation not found"));
        }
        Ok(conversation)
    }

    /// `user_id`'s conversations, most recent activity first.
    pub fn list_for(&self, user_id: Uuid, limit: usize) -> Result<Vec<Conversation>, ChatError> {
        let mut conversations = self.store.conversations_for(user_id)?;
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        conversations.truncate(limit);
        Ok(conversations)
    }

    /// Timestamp source shared with the store.
    pub fn now(&self) -> DateTime<Utc> {
        self.store.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::shared_store;

    #[test]
    fn test_resolve_is_symmetric() {
        let (_dir, store) = shared_store();
        let registry = ConversationRegistry::new(store);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let ab = registry.resolve(a, b).unwrap();
        let ba = registry.resolve(b, a).unwrap();
        assert_eq!(ab.id, ba.id);
        assert_eq!(registry.list_for(a, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_self_is_validation_error() {
        let (_dir, store) = shared_store();
        let registry = ConversationRegistry::new(store);
        let a = Uuid::new_v4();
        let err = registry.resolve(a, a).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_concurrent_resolve_creates_one() {
        let (_dir, store) = shared_store();
        let registry = Arc::new(ConversationRegistry::new(store));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        registry.resolve(a, b).unwrap().id
                    } else {
                        registry.resolve(b, a).unwrap().id
                    }
                })
            })
            .collect();

        let ids: Vec<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(registry.list_for(a, 10).unwrap().len(), 1);
        assert_eq!(registry.list_for(b, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_for_member_hides_foreign_conversations() {
        let (_dir, store) = shared_store();
        let registry = ConversationRegistry::new(store);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let conversation = registry.resolve(a, b).unwrap();

        assert!(registry.for_member(conversation.id, a).is_ok());
        let err = registry.for_member(conversation.id, Uuid::new_v4()).unwrap_err();
        assert_eq!(err.status_code(), 404);
        let err = registry.for_member(Uuid::new_v4(), a).unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_list_orders_by_recency() {
        let (_dir, store) = shared_store();
        let registry = ConversationRegistry::new(store);
        let me = Uuid::new_v4();
        let first = registry.resolve(me, Uuid::new_v4()).unwrap();
        let second = registry.resolve(me, Uuid::new_v4()).unwrap();

        let listed = registry.list_for(me, 10).unwrap();
        assert_eq!(listed[0].id, second.id);

        registry.touch(first.id).unwrap();
        let listed = registry.list_for(me, 10).unwrap();
        assert_eq!(listed[0].id, first.id);
        assert_eq!(registry.list_for(me, 1).unwrap().len(), 1);
    }
}
