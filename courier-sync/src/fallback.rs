//! Stateless request/response surface.
//!
//! A request is authenticated once with [`FallbackApi::authenticate`] and
//! the resulting [`Identity`] is passed to the call. Calls go through the
//! same [`ChatService`] methods as the live gateway, with no commit hooks:
//! the fallback path never broadcasts.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ChatError;
use crate::identity::{Credentials, Identity, IdentityVerifier};
use crate::protocol::SendMessageRequest;
use crate::service::{ChatService, ConversationView, ReadReceipt, SendReceipt};
use crate::storage::{Message, User};

pub struct FallbackApi {
    identity: Arc<dyn IdentityVerifier>,
    service: Arc<ChatService>,
}

impl FallbackApi {
    pub fn new(identity: Arc<dyn IdentityVerifier>, service: Arc<ChatService>) -> Self {
        Self { identity, service }
    }

    pub fn authenticate(&self, credentials: &Credentials) -> Result<Identity, ChatError> {
        credentials.authenticate(self.identity.as_ref()).map_err(|e| {
            log::debug!("Rejected request credentials: {e}");
            ChatError::from(e)
        })
    }

    pub fn me(&self, who: &Identity) -> Result<User, ChatError> {
        self.service.profile(who.user_id)
    }

    pub fn list_conversations(&self, who: &Identity) -> Result<Vec<ConversationView>, ChatError> {
        self.service.list_conversations(who.user_id)
    }

    pub fn open_conversation(
        &self,
        who: &Identity,
        peer_id: Option<Uuid>,
    ) -> Result<ConversationView, ChatError> {
        let peer_id = peer_id.ok_or_else(|| ChatError::validation("userId is required"))?;
        self.service.open_conversation(who.user_id, peer_id)
    }

    pub fn page_messages(
        &self,
        who: &Identity,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ChatError> {
        self.service
            .page_messages(who.user_id, conversation_id, before, limit)
    }

    pub fn send_message(
        &self,
        who: &Identity,
        request: SendMessageRequest,
    ) -> Result<SendReceipt, ChatError> {
        let (to, content) = request.validate()?;
        self.service.send_message(who.user_id, to, &content)
    }

    pub fn mark_conversation_read(
        &self,
        who: &Identity,
        conversation_id: Uuid,
    ) -> Result<ReadReceipt, ChatError> {
        self.service.mark_read(who.user_id, conversation_id)
    }
}
