//! # courier-sync — Real-time one-to-one messaging engine
//!
//! Persists users, conversations and messages, and pushes new messages,
//! typing signals and read receipts to every live connection of the
//! participants. Clients without a live channel use the HTTP fallback,
//! which shares the same persistence path but never broadcasts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌───────────────────┐      ┌────────────┐
//! │ ChatClient  │ ◄────────────────► │ ConnectionGateway │ ───► │ Fanout     │
//! │ (per device)│   JSON frames      │ (auth, presence)  │      │ ChannelHub │
//! └─────────────┘                    └─────────┬─────────┘      └────────────┘
//!                                              │
//! ┌─────────────┐       HTTP         ┌─────────▼─────────┐
//! │ any client  │ ─────────────────► │ ChatService       │
//! └─────────────┘   FallbackApi      │ registry+messages │
//!                                    └─────────┬─────────┘
//!                                              ▼
//!                                    ┌───────────────────┐
//!                                    │ ChatStore         │
//!                                    │ (RocksDB)         │
//!                                    └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`] — RocksDB records, indexes and stripe locks
//! - [`identity`] — bearer tokens and credential extraction
//! - [`presence`] — per-user connection counting
//! - [`registry`] — one conversation per unordered user pair
//! - [`messages`] — sanitized append, paging, read receipts
//! - [`broadcast`] / [`fanout`] — scoped channels and event routing
//! - [`protocol`] — JSON event frames with acknowledgements
//! - [`gateway`] — per-connection lifecycle
//! - [`fallback`] / [`http`] — request/response surface
//! - [`server`] — wires both listeners together
//! - [`client`] — WebSocket client with ack pairing

pub mod broadcast;
pub mod client;
pub mod error;
pub mod fallback;
pub mod fanout;
pub mod gateway;
pub mod http;
pub mod identity;
pub mod messages;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod sanitize;
pub mod server;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{ChannelHub, ChannelScope, ChannelStats};
pub use client::{ChatClient, ChatEvent, ConnectionState};
pub use error::ChatError;
pub use fallback::FallbackApi;
pub use fanout::{Fanout, FanoutStats};
pub use gateway::ConnectionGateway;
pub use identity::{AuthError, Credentials, Identity, IdentityVerifier, TokenVerifier};
pub use messages::MessageStore;
pub use presence::{PresenceLease, PresenceTracker};
pub use protocol::{
    AckBody, ClientEvent, ClientFrame, ProtocolError, ReadNotice, SendMessageRequest,
    ServerEvent, TypingNotice,
};
pub use registry::ConversationRegistry;
pub use server::{ChatServer, ServerConfig, ServerStats};
pub use service::{ChatService, ConversationView, ReadReceipt, SendReceipt};
pub use storage::{ChatStore, Conversation, Message, StoreConfig, StoreError, User};
