//! Leader election.
//!
//! For a given instance name, exactly one node is `leader` at a time so
//! that singleton plugins (cron, pruner, lifeline, reindexer) run once
//! cluster-wide. The election strategy itself is adapter-specific (DB row
//! vs. cluster lock) — this module defines the contract and the
//! supervised polling loop that watches it.

use crate::tap::{Tap, TelemetryEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Implemented by each election strategy. `tick` performs one round:
/// attempt to become leader (or refresh leadership if already held) and
/// returns the up-to-date status.
#[async_trait]
pub trait Peer: Send + Sync {
    fn instance_name(&self) -> &str;

    async fn tick(&self) -> bool;

    /// Called on graceful shutdown: release the claim and (for DB peers)
    /// publish `leader{down}` so peers re-elect immediately.
    async fn release(&self);
}

/// A peer that is always leader — used when `peer = disabled` (single
/// node, or tests that don't need election at all).
pub struct AlwaysLeader {
    name: String,
}

impl AlwaysLeader {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Peer for AlwaysLeader {
    fn instance_name(&self) -> &str {
        &self.name
    }

    async fn tick(&self) -> bool {
        true
    }

    async fn release(&self) {}
}

/// Default election interval: ≈30s.
pub const DEFAULT_ELECTION_INTERVAL: Duration = Duration::from_secs(30);
/// Leader refresh boost factor: the incumbent refreshes at `interval / boost`.
pub const DEFAULT_BOOST: u32 = 2;

/// Runs a [`Peer`]'s election loop as a supervised task and exposes a
/// `watch::Receiver<bool>` so plugins can react to leadership changes
/// without polling the peer directly.
pub struct PeerHandle {
    status: watch::Receiver<bool>,
    task: tokio::task::JoinHandle<()>,
    peer: Arc<dyn Peer>,
}

impl PeerHandle {
    pub fn spawn(peer: Arc<dyn Peer>, election_interval: Duration, boost: u32, tap: Option<Tap>) -> Self {
        let (tx, rx) = watch::channel(false);
        let loop_peer = peer.clone();
        let task = tokio::spawn(async move {
            let refresh_interval = election_interval / boost.max(1);
            loop {
                let is_leader = loop_peer.tick().await;
                let changed = *tx.borrow() != is_leader;
                let _ = tx.send(is_leader);
                if changed {
                    tracing::info!(
                        target: "oban::peer",
                        leader = is_leader,
                        instance = loop_peer.instance_name(),
                        "election"
                    );
                    if let Some(tap) = &tap {
                        tap.emit(TelemetryEvent::LeaderChanged {
                            instance: loop_peer.instance_name().to_string(),
                            leader: is_leader,
                        });
                    }
                }
                let sleep_for = if is_leader {
                    refresh_interval
                } else {
                    election_interval
                };
                tokio::time::sleep(sleep_for).await;
            }
        });
        Self {
            status: rx,
            task,
            peer,
        }
    }

    pub fn is_leader(&self) -> bool {
        *self.status.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.status.clone()
    }

    pub async fn shutdown(self) {
        self.task.abort();
        self.peer.release().await;
    }
}
