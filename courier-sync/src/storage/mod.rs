//! Persistent storage layer for users, conversations and messages.
//!
//! Architecture:
//! ```text
//! ┌───────────────────┐   guarded writes   ┌──────────────────────────────────┐
//! │ ConversationReg.  │ ─────────────────► │ ChatStore (RocksDB)              │
//! │ MessageStore      │                    │                                  │
//! │ PresenceTracker   │                    │ CF "users"         profiles      │
//! └───────────────────┘                    │ CF "conversations" records       │
//!                                          │ CF "pairs"         pair → id     │
//!                                          │ CF "memberships"   user ++ conv  │
//!                                          │ CF "messages"      conv ++ ts ++ id │
//!                                          └──────────────────────────────────┘
//! ```
//!
//! Writers that read-modify-write a conversation hold its stripe lock from
//! [`locks`]; the store's write methods take the guard as a parameter.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod locks;
pub mod records;
pub mod rocks;

pub use locks::{ConversationGuard, LockStripes, PairGuard};
pub use records::{Conversation, Message, PairKey, User};
pub use rocks::{ChatStore, StoreConfig, StoreError};
