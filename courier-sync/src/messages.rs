//! Message append, pagination and read marking.
//!
//! Writes to one conversation are serialized by its stripe lock. The
//! `*_with` variants run a commit hook while that lock is still held, right
//! after the batch is acknowledged by RocksDB. Fanout lives in that hook,
//! so subscribers see a conversation's events in write order and never see
//! an event for a write that failed.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ChatError;
use crate::sanitize::sanitize;
use crate::storage::{ChatStore, Conversation, Message};

/// Page size when the caller gives none.
pub const DEFAULT_PAGE_SIZE: usize = 30;

/// Upper bound on a single page.
pub const MAX_PAGE_SIZE: usize = 100;

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    /// The conversation with `last_message_at` already bumped
    pub conversation: Conversation,
}

pub struct MessageStore {
    store: Arc<ChatStore>,
}

impl MessageStore {
    pub fn new(store: Arc<ChatStore>) -> Self {
        Self { store }
    }

    pub fn append(
        &self,
        conversation: &Conversation,
        from: Uuid,
        raw_content: &str,
    ) -> Result<Appended, ChatError> {
        self.append_with(conversation, from, raw_content, |_| {})
    }

    /// Sanitize and persist a message from `from` to the other participant.
    ///
    /// Empty content after sanitizing is rejected before any write.
    /// `on_commit` runs only after the write succeeded, under the
    /// conversation lock.
    pub fn append_with<F>(
        &self,
        conversation: &Conversation,
        from: Uuid,
        raw_content: &str,
        on_commit: F,
    ) -> Result<Appended, ChatError>
    where
        F: FnOnce(&Message),
    {
        let to = conversation
            .peer_of(from)
            .ok_or_else(|| ChatError::not_found("Conversation not found"))?;

        let content = sanitize(raw_content);
        if content.is_empty() {
            return Err(ChatError::validation("Message content is empty"));
        }

        let guard = self.store.lock_conversation(conversation.id);
        let now = self.store.now();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            from,
            to,
            content,
            sent_at: now,
            created_at: now,
            read_at: None,
        };

        let conversation = self.store.insert_message(&guard, &message).map_err(|e| {
            log::error!("Failed to persist message in {}: {e}", message.conversation_id);
            ChatError::from(e)
        })?;
        log::debug!("Message {} appended to {}", message.id, conversation.id);

        on_commit(&message);
        drop(guard);

        Ok(Appended {
            message,
            conversation,
        })
    }

    /// The most recent `limit` messages before `before`, oldest first.
    ///
    /// `limit` defaults to [`DEFAULT_PAGE_SIZE`] and is capped at
    /// [`MAX_PAGE_SIZE`]; zero is a validation error.
    pub fn page(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ChatError> {
        let limit = match limit {
            Some(0) => return Err(ChatError::validation("limit must be at least 1")),
            Some(n) => n.min(MAX_PAGE_SIZE),
            None => DEFAULT_PAGE_SIZE,
        };
        let mut messages = self.store.messages_before(conversation_id, before, limit)?;
        messages.reverse();
        Ok(messages)
    }

    pub fn latest(&self, conversation_id: Uuid) -> Result<Option<Message>, ChatError> {
        Ok(self.store.latest_message(conversation_id)?)
    }

    pub fn mark_all_read(&self, conversation_id: Uuid, reader: Uuid) -> Result<usize, ChatError> {
        self.mark_all_read_with(conversation_id, reader, |_| {})
    }

    /// Mark every unread message to `reader` as read, all or nothing.
    ///
    /// Idempotent: a second call marks nothing and still succeeds.
    /// `on_commit` receives the number of messages marked.
    pub fn mark_all_read_with<F>(
        &self,
        conversation_id: Uuid,
        reader: Uuid,
        on_commit: F,
    ) -> Result<usize, ChatError>
    where
        F: FnOnce(usize),
    {
        let guard = self.store.lock_conversation(conversation_id);
        let at = self.store.now();
        let marked = self.store.mark_read(&guard, reader, at).map_err(|e| {
            log::error!("Failed to mark {conversation_id} read for {reader}: {e}");
            ChatError::from(e)
        })?;
        on_commit(marked);
        Ok(marked)
    }
}
