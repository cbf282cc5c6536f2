//! Best-effort pub/sub coupling producers to staging.
//!
//! Delivery is at-most-once and optimization-only: correctness never
//! depends on a notification arriving (staging + polling is the safety
//! net — see [`crate::producer`]'s local-mode fallback). An in-memory
//! fan-out over four fixed channels, backed by `tokio::sync::broadcast`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Insert,
    Signal,
    Leader,
    Gossip,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Insert => "insert",
            Channel::Signal => "signal",
            Channel::Leader => "leader",
            Channel::Gossip => "gossip",
        }
    }
}

/// `signal` control messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Signal {
    Pause { queue: Option<String> },
    Resume { queue: Option<String> },
    Scale { queue: String, limit: usize },
    Cancel { job_id: i64 },
}

/// The union of payloads that can arrive on any channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notification {
    Insert { queue: String },
    Signal(Signal),
    Leader { down: String },
    Gossip { queue: String, payload: serde_json::Value },
}

impl Notification {
    pub fn channel(&self) -> Channel {
        match self {
            Notification::Insert { .. } => Channel::Insert,
            Notification::Signal(_) => Channel::Signal,
            Notification::Leader { .. } => Channel::Leader,
            Notification::Gossip { .. } => Channel::Gossip,
        }
    }
}

/// The notifier contract. Implementations must transparently re-subscribe
/// on reconnect — callers never see a "channel dropped" condition, only a
/// stream that may go briefly quiet.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: Notification);

    /// Subscribes to one channel, returning a receiver of just that
    /// channel's notifications.
    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification>;
}

/// A single-node, in-process notifier built on `tokio::sync::broadcast`.
/// This is the implementation `oban-testing` always uses, and the
/// building block a real cross-host "cluster-backed" notifier would wrap
/// with a network transport — that transport is out of scope here, so
/// `LocalNotifier` is what single-node deployments use directly.
pub struct LocalNotifier {
    insert: broadcast::Sender<Notification>,
    signal: broadcast::Sender<Notification>,
    leader: broadcast::Sender<Notification>,
    gossip: broadcast::Sender<Notification>,
}

impl LocalNotifier {
    pub fn new() -> Self {
        let cap = 1024;
        Self {
            insert: broadcast::channel(cap).0,
            signal: broadcast::channel(cap).0,
            leader: broadcast::channel(cap).0,
            gossip: broadcast::channel(cap).0,
        }
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<Notification> {
        match channel {
            Channel::Insert => &self.insert,
            Channel::Signal => &self.signal,
            Channel::Leader => &self.leader,
            Channel::Gossip => &self.gossip,
        }
    }
}

impl Default for LocalNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for LocalNotifier {
    async fn publish(&self, notification: Notification) {
        // `send` only errors when there are no subscribers, which is a
        // perfectly normal state for an at-most-once bus.
        let _ = self.sender(notification.channel()).send(notification);
    }

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification> {
        self.sender(channel).subscribe()
    }
}
