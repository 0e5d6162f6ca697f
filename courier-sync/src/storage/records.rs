//! Durable record types.
//!
//! The same structs are persisted (bincode) and sent over the wire
//! (JSON, camelCase), so a client always sees exactly what was stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Public user profile, including the presence fields owned by the
/// presence tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub display_name: String,
    pub is_online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(display_name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.into(),
            is_online: false,
            last_seen_at: None,
            created_at,
        }
    }
}

/// A one-to-one conversation between exactly two distinct users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    /// Normalized order: `participants[0] < participants[1]`
    pub participants: [Uuid; 2],
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(pair: PairKey, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            participants: pair.participants(),
            last_message_at: now,
            created_at: now,
        }
    }

    pub fn pair(&self) -> PairKey {
        PairKey {
            low: self.participants[0],
            high: self.participants[1],
        }
    }

    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    /// The other participant, if `user_id` belongs to this conversation.
    pub fn peer_of(&self, user_id: Uuid) -> Option<Uuid> {
        match self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }
}

/// A persisted chat message. `read_at == None` means unread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub from: Uuid,
    pub to: Uuid,
    /// Plain text, markup already stripped
    pub content: String,
    pub sent_at: DateTime<Utc>,
    /// Authoritative ordering key
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

/// Unordered participant pair.
///
/// `(a, b)` and `(b, a)` normalize to the same key; this is the
/// uniqueness key for conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    low: Uuid,
    high: Uuid,
}

impl PairKey {
    /// Returns `None` when both sides are the same user.
    pub fn new(a: Uuid, b: Uuid) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Some(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn participants(&self) -> [Uuid; 2] {
        [self.low, self.high]
    }

    /// Storage key: `low (16 bytes) ++ high (16 bytes)`.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(self.low.as_bytes());
        key[16..].copy_from_slice(self.high.as_bytes());
        key
    }
}
