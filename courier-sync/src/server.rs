//! Chat server: live WebSocket gateway plus the HTTP fallback.
//!
//! Architecture:
//! ```text
//! Client A ──┐  WebSocket                        HTTP  ┌── Client C
//!             ├──────────► ConnectionGateway           │  (no live channel)
//! Client B ──┘                 │                       ▼
//!                              │                  FallbackApi
//!                              ▼                       │
//!                        ChatService ◄─────────────────┘
//!                     (registry + messages)
//!                              │ commit hooks (live path only)
//!                              ▼
//!                        Fanout ── ChannelHub
//!                                   ├── conversation:<id>
//!                                   └── user:<id>
//! ```
//!
//! Both listeners share one `ChatService`, so a message sent over HTTP is
//! exactly what a live client later pages in.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 3 & 8

use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::broadcast::ChannelHub;
use crate::fallback::FallbackApi;
use crate::fanout::Fanout;
use crate::gateway::ConnectionGateway;
use crate::identity::{IdentityVerifier, TokenVerifier};
use crate::presence::PresenceTracker;
use crate::registry::DEFAULT_LIST_LIMIT;
use crate::service::ChatService;
use crate::storage::{ChatStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket address to bind to
    pub ws_addr: String,
    /// HTTP fallback address to bind to
    pub http_addr: String,
    /// Broadcast channel capacity per scope
    pub broadcast_capacity: usize,
    /// Frames buffered per connection before forwarders wait
    pub outbox_capacity: usize,
    /// Conversations returned by list-conversations
    pub list_limit: usize,
    /// Persistence storage path
    pub storage_path: PathBuf,
    /// HMAC secret for bearer tokens
    pub token_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: "127.0.0.1:9090".to_string(),
            http_addr: "127.0.0.1:9091".to_string(),
            broadcast_capacity: 256,
            outbox_capacity: 256,
            list_limit: DEFAULT_LIST_LIMIT,
            storage_path: PathBuf::from("courier_data"),
            token_secret: "change-me".to_string(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub messages_sent: u64,
    pub read_receipts: u64,
    pub typing_relays: u64,
    pub active_channels: usize,
    pub online_users: usize,
}

/// The chat server.
pub struct ChatServer {
    config: ServerConfig,
    store: Arc<ChatStore>,
    service: Arc<ChatService>,
    presence: Arc<PresenceTracker>,
    fanout: Arc<Fanout>,
    gateway: Arc<ConnectionGateway>,
    fallback: Arc<FallbackApi>,
}

impl ChatServer {
    /// Open the store at `config.storage_path` and verify tokens with
    /// `config.token_secret`.
    ///
    /// Online flags persisted by a previous run are cleared before the
    /// server is returned.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        let store = Arc::new(ChatStore::open(StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        })?);
        let identity = Arc::new(TokenVerifier::new(&config.token_secret, store.clone()));
        let server = Self::new(config, store, identity);
        server.presence.recover()?;
        Ok(server)
    }

    /// Assemble a server around an open store and an identity verifier.
    pub fn new(config: ServerConfig, store: Arc<ChatStore>, identity: Arc<dyn IdentityVerifier>) -> Self {
        let hub = Arc::new(ChannelHub::new(config.broadcast_capacity));
        let fanout = Arc::new(Fanout::new(hub));
        let presence = Arc::new(PresenceTracker::new(store.clone()));
        let service = Arc::new(ChatService::new(store.clone()).with_list_limit(config.list_limit));

        let gateway = Arc::new(ConnectionGateway::new(
            identity.clone(),
            presence.clone(),
            service.clone(),
            fanout.clone(),
            config.outbox_capacity,
        ));
        let fallback = Arc::new(FallbackApi::new(identity, service.clone()));

        Self {
            config,
            store,
            service,
            presence,
            fanout,
            gateway,
            fallback,
        }
    }

    /// Bind both listeners and serve until one of them fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_listener = TcpListener::bind(&self.config.ws_addr).await?;
        let http_listener = TcpListener::bind(&self.config.http_addr).await?;
        self.serve(ws_listener, http_listener).await
    }

    /// Serve on already-bound listeners.
    pub async fn serve(
        &self,
        ws_listener: TcpListener,
        http_listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Live gateway listening on {}", ws_listener.local_addr()?);
        log::info!("HTTP fallback listening on {}", http_listener.local_addr()?);

        tokio::try_join!(self.serve_live(ws_listener), self.serve_fallback(http_listener))?;
        Ok(())
    }

    async fn serve_live(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn serve_fallback(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = crate::http::router(self.fallback.clone());
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let connections = self.gateway.counters();
        let fanout = self.fanout.stats();
        ServerStats {
            total_connections: connections.total(),
            active_connections: connections.active(),
            rejected_handshakes: connections.rejected(),
            messages_sent: fanout.messages,
            read_receipts: fanout.read_receipts,
            typing_relays: fanout.typing,
            active_channels: self.fanout.hub().channel_count(),
            online_users: self.presence.online_users().len(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    pub fn service(&self) -> &Arc<ChatService> {
        &self.service
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        self.fanout.hub()
    }
}
