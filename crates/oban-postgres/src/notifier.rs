//! `PgNotifier`: the DB-backed half of `Notifier`, grounded
//! on the `PgListener`/`pg_notify`/`tokio::select!`-with-poll-fallback
//! pattern in `apps-server-src-queue-postgres.rs`'s `listen` method.
//!
//! One background task owns the `PgListener` and fans each decoded
//! payload out to the matching in-process `broadcast` channel; `publish`
//! itself is a plain `pg_notify` call so every listening node — including
//! this one — observes the same event through the same path.

use async_trait::async_trait;
use oban_core::notifier::{Channel, Notification, Notifier};
use sqlx::postgres::{PgListener, PgNotification};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const CHANNELS: [Channel; 4] = [Channel::Insert, Channel::Signal, Channel::Leader, Channel::Gossip];

/// How often the select loop wakes up even without a notification, so a
/// connection that `PgListener` is quietly reconnecting doesn't wedge
/// anything waiting on it. Purely a liveness tick — the loop does nothing
/// on a poll firing beyond looping back to `listener.recv()`.
const POLL_FALLBACK: Duration = Duration::from_secs(5);

const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

fn channel_name(prefix: &str, channel: Channel) -> String {
    format!("{prefix}_{}", channel.as_str())
}

fn channel_from_name(prefix: &str, name: &str) -> Option<Channel> {
    let suffix = name.strip_prefix(prefix)?.strip_prefix('_')?;
    match suffix {
        "insert" => Some(Channel::Insert),
        "signal" => Some(Channel::Signal),
        "leader" => Some(Channel::Leader),
        "gossip" => Some(Channel::Gossip),
        _ => None,
    }
}

pub struct PgNotifier {
    pool: PgPool,
    prefix: String,
    insert: broadcast::Sender<Notification>,
    signal: broadcast::Sender<Notification>,
    leader: broadcast::Sender<Notification>,
    gossip: broadcast::Sender<Notification>,
}

impl PgNotifier {
    /// Connects a dedicated `PgListener` on `prefix_{insert,signal,leader,
    /// gossip}` and spawns the task that keeps it alive. The returned
    /// `Arc` coerces to `Arc<dyn Notifier>` at the call site.
    pub async fn connect(pool: PgPool, prefix: impl Into<String>) -> Result<Arc<Self>, sqlx::Error> {
        let prefix = prefix.into();
        let cap = 1024;
        let this = Arc::new(Self {
            pool: pool.clone(),
            prefix: prefix.clone(),
            insert: broadcast::channel(cap).0,
            signal: broadcast::channel(cap).0,
            leader: broadcast::channel(cap).0,
            gossip: broadcast::channel(cap).0,
        });

        let mut listener = PgListener::connect_with(&pool).await?;
        for channel in CHANNELS {
            listener.listen(&channel_name(&prefix, channel)).await?;
        }

        let task = this.clone();
        tokio::spawn(async move { task.run(listener).await });

        Ok(this)
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<Notification> {
        match channel {
            Channel::Insert => &self.insert,
            Channel::Signal => &self.signal,
            Channel::Leader => &self.leader,
            Channel::Gossip => &self.gossip,
        }
    }

    async fn run(&self, mut listener: PgListener) {
        let mut poll = tokio::time::interval(POLL_FALLBACK);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                recv = listener.recv() => match recv {
                    Ok(notification) => self.dispatch(&notification),
                    Err(err) => {
                        tracing::warn!(
                            target: "oban::notifier",
                            error = %err,
                            "listener connection lost, PgListener will reconnect"
                        );
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                },
                _ = poll.tick() => {}
            }
        }
    }

    fn dispatch(&self, notification: &PgNotification) {
        let Some(channel) = channel_from_name(&self.prefix, notification.channel()) else {
            return;
        };
        match serde_json::from_str::<Notification>(notification.payload()) {
            Ok(parsed) => {
                let _ = self.sender(channel).send(parsed);
            }
            Err(err) => {
                tracing::warn!(
                    target: "oban::notifier",
                    error = %err,
                    channel = notification.channel(),
                    "dropping malformed notify payload"
                );
            }
        }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn publish(&self, notification: Notification) {
        let channel = channel_name(&self.prefix, notification.channel());
        let payload = match serde_json::to_string(&notification) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(target: "oban::notifier", error = %err, "failed to encode notification");
                return;
            }
        };

        if let Err(err) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(target: "oban::notifier", error = %err, "pg_notify failed");
        }
    }

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification> {
        self.sender(channel).subscribe()
    }
}
