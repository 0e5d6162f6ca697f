//! Delivery fanout, read-receipt broadcast and the typing relay.
//!
//! Each event is encoded once and published to its scopes:
//!
//! | Event           | Scopes                                         |
//! |-----------------|------------------------------------------------|
//! | `message:new`   | conversation, recipient user, sender user      |
//! | `messages:read` | conversation                                   |
//! | `typing`        | recipient user                                 |
//!
//! Callers invoke `message_new` and `messages_read` only after the write
//! they report has committed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::broadcast::{ChannelHub, ChannelScope};
use crate::protocol::{ProtocolError, ReadNotice, ServerEvent, TypingNotice};
use crate::storage::Message;

/// Lock-free fanout counters.
#[derive(Default)]
struct FanoutCounters {
    messages: AtomicU64,
    read_receipts: AtomicU64,
    typing: AtomicU64,
}

/// Snapshot of [`Fanout`] counters.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub messages: u64,
    pub read_receipts: u64,
    pub typing: u64,
}

pub struct Fanout {
    hub: Arc<ChannelHub>,
    counters: FanoutCounters,
}

impl Fanout {
    pub fn new(hub: Arc<ChannelHub>) -> Self {
        Self {
            hub,
            counters: FanoutCounters::default(),
        }
    }

    /// Broadcast a persisted message. Returns the number of receivers.
    pub fn message_new(&self, message: &Message) -> Result<usize, ProtocolError> {
        let frame = ServerEvent::MessageNew(message.clone()).to_frame()?;
        let delivered = [
            ChannelScope::Conversation(message.conversation_id),
            ChannelScope::User(message.to),
            ChannelScope::User(message.from),
        ]
        .into_iter()
        .map(|scope| self.hub.publish(scope, Arc::clone(&frame)))
        .sum();

        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        log::debug!("message:new {} → {delivered} receivers", message.id);
        Ok(delivered)
    }

    /// Announce that `reader_id` has read the conversation.
    pub fn messages_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<usize, ProtocolError> {
        let frame = ServerEvent::MessagesRead(ReadNotice {
            conversation_id,
            reader_id,
        })
        .to_frame()?;
        let delivered = self
            .hub
            .publish(ChannelScope::Conversation(conversation_id), frame);

        self.counters.read_receipts.fetch_add(1, Ordering::Relaxed);
        log::debug!("messages:read {conversation_id} by {reader_id} → {delivered} receivers");
        Ok(delivered)
    }

    /// Relay a typing signal to `to_user_id` only. Best effort: failures
    /// are logged, never returned.
    pub fn typing(&self, from_user_id: Uuid, to_user_id: Uuid, is_typing: bool) -> usize {
        let event = ServerEvent::Typing(TypingNotice {
            from_user_id,
            is_typing,
        });
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping typing signal from {from_user_id}: {e}");
                return 0;
            }
        };

        self.counters.typing.fetch_add(1, Ordering::Relaxed);
        let delivered = self.hub.publish(ChannelScope::User(to_user_id), frame);
        log::trace!("typing {from_user_id} → {to_user_id} ({is_typing}), {delivered} receivers");
        delivered
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            messages: self.counters.messages.load(Ordering::Relaxed),
            read_receipts: self.counters.read_receipts.load(Ordering::Relaxed),
            typing: self.counters.typing.load(Ordering::Relaxed),
        }
    }
}
