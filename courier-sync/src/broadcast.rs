//! Scoped fan-out channels with backpressure.
//!
//! Every conversation and every user has its own broadcast channel,
//! created on first subscription and dropped when the last subscriber
//! leaves. Frames are encoded once and shared as `Arc<str>` between all
//! receivers. A receiver that falls more than `capacity` frames behind
//! skips ahead (tokio `Lagged`), which is counted as dropped.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A pre-encoded server frame.
pub type Frame = Arc<str>;

/// An addressable fanout scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelScope {
    Conversation(Uuid),
    User(Uuid),
}

impl fmt::Display for ChannelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelScope::Conversation(id) => write!(f, "conversation:{id}"),
            ChannelScope::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub subscribers: usize,
}

/// One scope's broadcast channel.
pub struct Channel {
    sender: broadcast::Sender<Frame>,
    /// connection id → user id
    subscribers: DashMap<Uuid, Uuid>,
    capacity: usize,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: DashMap::new(),
            capacity,
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Register a connection and return its receiver.
    ///
    /// A connection subscribing twice keeps a single registration.
    pub fn subscribe(&self, connection_id: Uuid, user_id: Uuid) -> broadcast::Receiver<Frame> {
        self.subscribers.insert(connection_id, user_id);
        self.sender.subscribe()
    }

    pub fn unsubscribe(&self, connection_id: &Uuid) -> bool {
        self.subscribers.remove(connection_id).is_some()
    }

    /// Send a frame to every current receiver. Returns the receiver count.
    pub fn publish(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_subscriber(&self, connection_id: &Uuid) -> bool {
        self.subscribers.contains_key(connection_id)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            subscribers: self.subscribers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// All live channels, keyed by scope.
pub struct ChannelHub {
    channels: DashMap<ChannelScope, Arc<Channel>>,
    capacity: usize,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Subscribe a connection to `scope`, creating the channel if needed.
    ///
    /// Returns the channel too, so the caller can record lag on it.
    pub fn subscribe(
        &self,
        scope: ChannelScope,
        connection_id: Uuid,
        user_id: Uuid,
    ) -> (Arc<Channel>, broadcast::Receiver<Frame>) {
        // Registration happens under the entry lock so a concurrent
        // unsubscribe cannot remove the channel in between.
        let entry = self
            .channels
            .entry(scope)
            .or_insert_with(|| Arc::new(Channel::new(self.capacity)));
        let rx = entry.subscribe(connection_id, user_id);
        (Arc::clone(entry.value()), rx)
    }

    /// Remove a connection from `scope`; drops the channel once empty.
    pub fn unsubscribe(&self, scope: ChannelScope, connection_id: &Uuid) -> bool {
        let removed = match self.channels.get(&scope) {
            Some(channel) => channel.unsubscribe(connection_id),
            None => return false,
        };
        self.channels
            .remove_if(&scope, |_, channel| channel.subscriber_count() == 0);
        removed
    }

    /// Publish to `scope`. A scope nobody listens to costs nothing.
    pub fn publish(&self, scope: ChannelScope, frame: Frame) -> usize {
        // Clone out of the map so no shard lock is held while sending.
        let channel = self.channels.get(&scope).map(|c| Arc::clone(c.value()));
        match channel {
            Some(channel) => channel.publish(frame),
            None => 0,
        }
    }

    pub fn channel(&self, scope: ChannelScope) -> Option<Arc<Channel>> {
        self.channels.get(&scope).map(|c| Arc::clone(c.value()))
    }

    pub fn subscriber_count(&self, scope: ChannelScope) -> usize {
        self.channels
            .get(&scope)
            .map(|c| c.subscriber_count())
            .unwrap_or(0)
    }

    /// Get the number of live channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn active_scopes(&self) -> Vec<ChannelScope> {
        self.channels.iter().map(|e| *e.key()).collect()
    }
}
