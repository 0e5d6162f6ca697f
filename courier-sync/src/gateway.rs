//! Live connection gateway.
//!
//! Per connection:
//! 1. authenticate inside the WebSocket handshake (reject with 401 before
//!    the upgrade, so nothing is registered for a bad credential)
//! 2. acquire presence, then subscribe to the user's own channel
//! 3. only then start reading client frames
//!
//! Broadcast receivers are drained by one forwarder task per subscribed
//! scope into a bounded per-connection outbox, which the connection task
//! writes to the socket. A subscriber that falls so far behind that its
//! channel drops frames gets disconnected: its client reconnects and pages
//! instead of silently missing durable messages. On disconnect the
//! subscriptions are dropped first, then the presence lease, which
//! releases exactly once.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::broadcast::{Channel, ChannelHub, ChannelScope, Frame};
use crate::error::ChatError;
use crate::fanout::Fanout;
use crate::identity::{AuthError, Credentials, Identity, IdentityVerifier};
use crate::presence::PresenceTracker;
use crate::protocol::{AckBody, ClientEvent, ClientFrame, ServerEvent};
use crate::service::ChatService;

/// Connection counters.
#[derive(Default)]
pub struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
    rejected: AtomicU64,
}

impl ConnectionCounters {
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

pub struct ConnectionGateway {
    identity: Arc<dyn IdentityVerifier>,
    presence: Arc<PresenceTracker>,
    service: Arc<ChatService>,
    fanout: Arc<Fanout>,
    outbox_capacity: usize,
    counters: ConnectionCounters,
}

impl ConnectionGateway {
    pub fn new(
        identity: Arc<dyn IdentityVerifier>,
        presence: Arc<PresenceTracker>,
        service: Arc<ChatService>,
        fanout: Arc<Fanout>,
        outbox_capacity: usize,
    ) -> Self {
        Self {
            identity,
            presence,
            service,
            fanout,
            outbox_capacity: outbox_capacity.max(1),
            counters: ConnectionCounters::default(),
        }
    }

    pub fn counters(&self) -> &ConnectionCounters {
        &self.counters
    }

    /// Run one connection to completion.
    pub async fn handle(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut identity: Option<Identity> = None;
        let verifier = Arc::clone(&self.identity);
        let callback = |request: &Request, response: Response| {
            let credentials = Credentials::from_headers(request.headers(), request.uri().query());
            match credentials.authenticate(verifier.as_ref()) {
                Ok(who) => {
                    identity = Some(who);
                    Ok(response)
                }
                Err(e) => Err(reject(&e)),
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(tungstenite::Error::Http(response)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected handshake from {addr}: {}", response.status());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(identity) = identity else {
            return Ok(());
        };

        let lease = self.presence.lease(identity.user_id)?;
        let (outbox_tx, outbox_rx) = mpsc::channel::<Frame>(self.outbox_capacity);
        let mut subscriptions = Subscriptions::new(
            Arc::clone(self.fanout.hub()),
            identity.user_id,
            outbox_tx,
        );
        subscriptions.join(ChannelScope::User(identity.user_id));

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Connection {} established for {} ({}) from {addr}",
            subscriptions.connection_id,
            identity.display_name,
            identity.user_id
        );

        let overflow = subscriptions.overflow();
        let result = tokio::select! {
            result = self.session(ws_stream, &identity, &mut subscriptions, outbox_rx) => result,
            _ = overflow.notified() => {
                log::warn!("Closing lagging connection for {} from {addr}", identity.user_id);
                Ok(())
            }
        };

        drop(subscriptions);
        drop(lease);
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection closed for {} from {addr}", identity.user_id);

        result
    }

    async fn session(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        identity: &Identity,
        subscriptions: &mut Subscriptions,
        mut outbox: mpsc::Receiver<Frame>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.dispatch(identity, subscriptions, text.as_str()) {
                                ws_sender.send(Message::text(reply)).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error for {}: {e}", identity.user_id);
                            break;
                        }
                        _ => {}
                    }
                }

                frame = outbox.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle one client frame. Returns the ack frame to send back, if any.
    fn dispatch(&self, identity: &Identity, subscriptions: &mut Subscriptions, text: &str) -> Option<String> {
        let frame = match ClientFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Malformed frame from {}: {e}", identity.user_id);
                return None;
            }
        };
        let ack = frame.ack;

        let body = match frame.into_event() {
            Ok(event) => match self.apply(identity, subscriptions, event) {
                Ok(Some(body)) => body,
                Ok(None) => return None,
                Err(e) => {
                    log::debug!("Action from {} failed: {e}", identity.user_id);
                    AckBody::failed(e.public_message())
                }
            },
            Err(e) => {
                log::warn!("Bad frame from {}: {e}", identity.user_id);
                AckBody::failed(e.to_string())
            }
        };

        let reply = ServerEvent::ack(ack?, body);
        match reply.encode() {
            Ok(text) => Some(text),
            Err(e) => {
                log::error!("Failed to encode ack: {e}");
                None
            }
        }
    }

    fn apply(
        &self,
        identity: &Identity,
        subscriptions: &mut Subscriptions,
        event: ClientEvent,
    ) -> Result<Option<AckBody>, ChatError> {
        let me = identity.user_id;
        match event {
            ClientEvent::JoinConversation(conversation_id) => {
                self.service.join_conversation(me, conversation_id)?;
                if subscriptions.join(ChannelScope::Conversation(conversation_id)) {
                    log::debug!("{me} joined conversation {conversation_id}");
                }
                Ok(Some(AckBody::joined(conversation_id)))
            }

            ClientEvent::SendMessage(request) => {
                let (to, content) = request.validate()?;
                let receipt = self.service.send_message_with(me, to, &content, |message| {
                    if let Err(e) = self.fanout.message_new(message) {
                        log::error!("Failed to broadcast message {}: {e}", message.id);
                    }
                })?;
                Ok(Some(AckBody::sent(receipt.message)))
            }

            ClientEvent::Typing(request) => {
                match request.to_user_id {
                    Some(to) => {
                        self.fanout.typing(me, to, request.is_typing);
                    }
                    None => log::warn!("Typing signal from {me} without a recipient"),
                }
                Ok(None)
            }

            ClientEvent::MarkRead(conversation_id) => {
                let receipt = self.service.mark_read_with(me, conversation_id, |_| {
                    if let Err(e) = self.fanout.messages_read(conversation_id, me) {
                        log::error!("Failed to broadcast read receipt for {conversation_id}: {e}");
                    }
                })?;
                Ok(Some(AckBody::read(conversation_id, receipt.updated)))
            }
        }
    }
}

/// Build the HTTP response for a refused upgrade.
fn reject(e: &AuthError) -> ErrorResponse {
    let err = ChatError::from(e.clone());
    let body = serde_json::json!({ "message": err.public_message() }).to_string();
    let mut response = ErrorResponse::new(Some(body));
    *response.status_mut() =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::UNAUTHORIZED);
    response
}

/// A connection's channel subscriptions.
struct Subscriptions {
    hub: Arc<ChannelHub>,
    connection_id: Uuid,
    user_id: Uuid,
    outbox: mpsc::Sender<Frame>,
    forwarders: HashMap<ChannelScope, JoinHandle<()>>,
    /// Signalled by a forwarder whose channel dropped frames
    overflow: Arc<Notify>,
}

impl Subscriptions {
    fn new(hub: Arc<ChannelHub>, user_id: Uuid, outbox: mpsc::Sender<Frame>) -> Self {
        Self {
            hub,
            connection_id: Uuid::new_v4(),
            user_id,
            outbox,
            forwarders: HashMap::new(),
            overflow: Arc::new(Notify::new()),
        }
    }

    fn overflow(&self) -> Arc<Notify> {
        Arc::clone(&self.overflow)
    }

    /// Subscribe to `scope`. Returns `false` when already subscribed.
    fn join(&mut self, scope: ChannelScope) -> bool {
        if self.forwarders.contains_key(&scope) {
            return false;
        }
        let (channel, rx) = self.hub.subscribe(scope, self.connection_id, self.user_id);
        let handle = tokio::spawn(forward(
            scope,
            channel,
            rx,
            self.outbox.clone(),
            Arc::clone(&self.overflow),
        ));
        self.forwarders.insert(scope, handle);
        true
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for (scope, handle) in self.forwarders.drain() {
            handle.abort();
            self.hub.unsubscribe(scope, &self.connection_id);
        }
    }
}

/// Move frames from one channel into the connection's outbox.
///
/// Stops and signals `overflow` once the channel reports skipped frames.
async fn forward(
    scope: ChannelScope,
    channel: Arc<Channel>,
    mut rx: broadcast::Receiver<Frame>,
    outbox: mpsc::Sender<Frame>,
    overflow: Arc<Notify>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if outbox.send(frame).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                channel.record_dropped(skipped);
                log::warn!("Subscriber on {scope} lagged by {skipped} frames");
                overflow.notify_one();
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
