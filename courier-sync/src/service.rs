//! The durable chat operations, shared by both transports.
//!
//! The live gateway and the HTTP fallback call exactly these methods, so
//! validation and storage never diverge between them. The optional commit
//! hooks are where the live path attaches fanout; the fallback passes
//! no-op hooks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ChatError;
use crate::messages::MessageStore;
use crate::registry::{ConversationRegistry, DEFAULT_LIST_LIMIT};
use crate::storage::{ChatStore, Conversation, Message, StoreError, User};

/// A conversation as shown to one of its participants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: Uuid,
    pub participants: Vec<User>,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_message: Option<Message>,
}

/// Result of a send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub conversation_id: Uuid,
    pub message: Message,
}

/// Result of a mark-read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub success: bool,
    pub updated: usize,
}

pub struct ChatService {
    store: Arc<ChatStore>,
    registry: ConversationRegistry,
    messages: MessageStore,
    list_limit: usize,
}

impl ChatService {
    pub fn new(store: Arc<ChatStore>) -> Self {
        Self {
            registry: ConversationRegistry::new(store.clone()),
            messages: MessageStore::new(store.clone()),
            store,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    pub fn with_list_limit(mut self, limit: usize) -> Self {
        self.list_limit = limit.max(1);
        self
    }

    /// A user's public profile.
    pub fn profile(&self, user_id: Uuid) -> Result<User, ChatError> {
        self.store.load_user(user_id).map_err(|e| user_error(e, "User not found"))
    }

    /// Resolve-or-create the conversation with `peer_id`.
    pub fn open_conversation(&self, requester: Uuid, peer_id: Uuid) -> Result<ConversationView, ChatError> {
        if requester == peer_id {
            return Err(ChatError::validation("Cannot start a conversation with yourself"));
        }
        self.ensure_user(peer_id, "User not found")?;
        let conversation = self.registry.resolve(requester, peer_id)?;
        self.view(conversation)
    }

    /// The requester's conversations, most recent first, each with its
    /// last message.
    pub fn list_conversations(&self, requester: Uuid) -> Result<Vec<ConversationView>, ChatError> {
        self.registry
            .list_for(requester, self.list_limit)?
            .into_iter()
            .map(|conversation| self.view(conversation))
            .collect()
    }

    pub fn send_message(&self, from: Uuid, to: Uuid, content: &str) -> Result<SendReceipt, ChatError> {
        self.send_message_with(from, to, content, |_| {})
    }

    /// Resolve the conversation, then persist the message.
    ///
    /// `on_commit` runs after the write, before the conversation lock is
    /// released.
    pub fn send_message_with<F>(
        &self,
        from: Uuid,
        to: Uuid,
        content: &str,
        on_commit: F,
    ) -> Result<SendReceipt, ChatError>
    where
        F: FnOnce(&Message),
    {
        if from == to {
            return Err(ChatError::validation("Cannot send a message to yourself"));
        }
        self.ensure_user(to, "Recipient not found")?;
        let conversation = self.registry.resolve(from, to)?;
        let appended = self.messages.append_with(&conversation, from, content, on_commit)?;
        Ok(SendReceipt {
            conversation_id: appended.conversation.id,
            message: appended.message,
        })
    }

    /// Check that `user_id` may subscribe to the conversation.
    pub fn join_conversation(&self, user_id: Uuid, conversation_id: Uuid) -> Result<Conversation, ChatError> {
        self.registry.for_member(conversation_id, user_id)
    }

    pub fn page_messages(
        &self,
        requester: Uuid,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ChatError> {
        self.registry.for_member(conversation_id, requester)?;
        self.messages.page(conversation_id, before, limit)
    }

    pub fn mark_read(&self, reader: Uuid, conversation_id: Uuid) -> Result<ReadReceipt, ChatError> {
        self.mark_read_with(reader, conversation_id, |_| {})
    }

    /// Mark everything addressed to `reader` read.
    ///
    /// `on_commit` runs after the batch commits, also when nothing was
    /// unread.
    pub fn mark_read_with<F>(&self, reader: Uuid, conversation_id: Uuid, on_commit: F) -> Result<ReadReceipt, ChatError>
    where
        F: FnOnce(usize),
    {
        self.registry.for_member(conversation_id, reader)?;
        let updated = self.messages.mark_all_read_with(conversation_id, reader, on_commit)?;
        Ok(ReadReceipt {
            success: true,
            updated,
        })
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    fn ensure_user(&self, user_id: Uuid, missing: &str) -> Result<(), ChatError> {
        if self.store.user_exists(user_id)? {
            Ok(())
        } else {
            Err(ChatError::not_found(missing))
        }
    }

    fn view(&self, conversation: Conversation) -> Result<ConversationView, ChatError> {
        let participants = conversation
            .participants
            .iter()
            .map(|id| self.store.load_user(*id))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| user_error(e, "Participant not found"))?;
        let last_message = self.messages.latest(conversation.id)?;

        Ok(ConversationView {
            id: conversation.id,
            participants,
            last_message_at: conversation.last_message_at,
            created_at: conversation.created_at,
            last_message,
        })
    }
}

fn user_error(e: StoreError, missing: &str) -> ChatError {
    match e {
        StoreError::NotFound(_) => ChatError::not_found(missing),
        other => other.into(),
    }
}
