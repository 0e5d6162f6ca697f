//! Domain errors shared by the live gateway and the HTTP fallback.
//!
//! Both surfaces report the same four kinds; each maps to one HTTP status
//! and one short message safe to show to a client.

use crate::identity::AuthError;
use crate::storage::StoreError;

#[derive(Debug, Clone)]
pub enum ChatError {
    /// Missing, malformed or rejected credentials
    Authentication(String),
    /// Bad input: empty content, self-conversation, missing fields
    Validation(String),
    /// Unknown user or conversation, or one the requester is not part of
    NotFound(String),
    /// The durable write or read failed
    Persistence(String),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ChatError::NotFound(msg.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ChatError::Authentication(_) => 401,
            ChatError::Validation(_) => 400,
            ChatError::NotFound(_) => 404,
            ChatError::Persistence(_) => 500,
        }
    }

    /// Message returned to clients. Persistence details stay in the log.
    pub fn public_message(&self) -> &str {
        match self {
            ChatError::Authentication(msg)
            | ChatError::Validation(msg)
            | ChatError::NotFound(msg) => msg,
            ChatError::Persistence(_) => "Internal server error",
        }
    }
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::Authentication(e) => write!(f, "Authentication failed: {e}"),
            ChatError::Validation(e) => write!(f, "Validation error: {e}"),
            ChatError::NotFound(e) => write!(f, "Not found: {e}"),
            ChatError::Persistence(e) => write!(f, "Persistence error: {e}"),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ChatError::NotFound(format!("{id} not found")),
            other => ChatError::Persistence(other.to_string()),
        }
    }
}

impl From<AuthError> for ChatError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Store(inner) => ChatError::Persistence(inner.to_string()),
            other => ChatError::Authentication(other.to_string()),
        }
    }
}
