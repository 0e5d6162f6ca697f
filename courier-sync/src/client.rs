//! WebSocket chat client.
//!
//! Provides:
//! - Connection lifecycle with a bearer token on the handshake
//! - Request/acknowledgement pairing for join, send and mark-read
//! - Typing signals (fire and forget)
//! - An event stream of pushed frames, with `message:new` deduplicated by
//!   message id (a connection can receive one message on several scopes)
//!
//! The event queue is bounded. When the application does not keep up,
//! events are dropped (and logged) rather than stalling the reader, so
//! acknowledgements keep flowing; page the conversation to catch up.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use uuid::Uuid;

use crate::protocol::{
    AckBody, ClientEvent, ClientFrame, ProtocolError, ReadNotice, SendMessageRequest,
    ServerEvent, TypingNotice, TypingRequest,
};
use crate::storage::Message;

/// Default wait for an acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the chat client.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A message was persisted in one of our conversations
    MessageNew(Message),
    /// The peer started or stopped typing
    Typing(TypingNotice),
    /// Someone read a conversation; re-fetch it to see `readAt`
    MessagesRead(ReadNotice),
}

/// Bounded memory of recently delivered message ids.
pub struct SeenMessages {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl SeenMessages {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            ids: HashSet::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Record `id`. Returns `false` if it was already seen.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<AckBody>>>>;

/// The chat client.
pub struct ChatClient {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    server_url: String,

    /// Bearer token sent on the handshake
    token: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<WsMessage>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ChatEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ChatEvent>,

    /// Requests waiting for their ack
    pending: PendingAcks,

    next_ack: AtomicU64,

    ack_timeout: Duration,
}

impl ChatClient {
    /// Create a new, disconnected client.
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            token: token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_ack: AtomicU64::new(1),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    /// A refused credential surfaces as [`ProtocolError::HandshakeRejected`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::HandshakeRejected(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ProtocolError::HandshakeRejected(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(tungstenite::Error::Http(response)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::HandshakeRejected(response.status().to_string()));
            }
            Err(e) => {
                log::debug!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, ChatEvent::Connected);

        // Reader task: route acks to waiters, everything else to events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let mut seen = SeenMessages::new(4096);
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        let event = match ServerEvent::decode(text.as_str()) {
                            Ok(event) => event,
                            Err(e) => {
                                log::warn!("Undecodable server frame: {e}");
                                continue;
                            }
                        };
                        let event = match event {
                            ServerEvent::Ack(ack) => {
                                if let Some(waiter) = pending.lock().await.remove(&ack.ack) {
                                    let _ = waiter.send(ack.body);
                                }
                                None
                            }
                            ServerEvent::MessageNew(message) => {
                                seen.insert(message.id).then_some(ChatEvent::MessageNew(message))
                            }
                            ServerEvent::Typing(notice) => Some(ChatEvent::Typing(notice)),
                            ServerEvent::MessagesRead(notice) => Some(ChatEvent::MessagesRead(notice)),
                        };
                        if let Some(evt) = event {
                            emit(&event_tx, evt);
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail every outstanding request
            pending.lock().await.clear();
            *state.write().await = ConnectionState::Disconnected;
            emit(&event_tx, ChatEvent::Disconnected);
        });

        Ok(())
    }

    /// Subscribe to a conversation's channel.
    pub async fn join_conversation(&self, conversation_id: Uuid) -> Result<AckBody, ProtocolError> {
        self.request(ClientEvent::JoinConversation(conversation_id)).await
    }

    /// Send a message; the ack carries the stored record.
    pub async fn send_message(&self, to_user_id: Uuid, content: impl Into<String>) -> Result<AckBody, ProtocolError> {
        self.request(ClientEvent::SendMessage(SendMessageRequest::new(to_user_id, content)))
            .await
    }

    /// Mark a conversation read.
    pub async fn mark_read(&self, conversation_id: Uuid) -> Result<AckBody, ProtocolError> {
        self.request(ClientEvent::MarkRead(conversation_id)).await
    }

    /// Send a typing signal. Never acknowledged.
    pub async fn send_typing(&self, to_user_id: Uuid, is_typing: bool) -> Result<(), ProtocolError> {
        let event = ClientEvent::Typing(TypingRequest {
            to_user_id: Some(to_user_id),
            is_typing,
        });
        self.send_frame(&event, None).await
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(WsMessage::Close(None)).await;
        }
    }

    async fn request(&self, event: ClientEvent) -> Result<AckBody, ProtocolError> {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.send_frame(&event, Some(id)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    async fn send_frame(&self, event: &ClientEvent, ack: Option<u64>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let text = ClientFrame::from_event(event, ack)?.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(WsMessage::text(text))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Queue an event without waiting for room.
fn emit(event_tx: &mpsc::Sender<ChatEvent>, event: ChatEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::warn!("Event queue full, dropping {event:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}
