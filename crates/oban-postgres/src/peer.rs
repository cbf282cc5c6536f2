//! `PgPeer`: the DB-row leader election strategy,
//! collapsed into a single `INSERT ... ON CONFLICT ... WHERE` statement
//! rather than the two-step "insert, then delete-if-expired" the prose
//! suggests — strictly stronger (no window where two nodes can both see
//! success) and still expressible as one round trip per `tick`.

use async_trait::async_trait;
use oban_core::notifier::{Notification, Notifier};
use oban_core::peer::Peer;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

pub struct PgPeer {
    pool: PgPool,
    notifier: Arc<dyn Notifier>,
    name: String,
    node: String,
    ttl_seconds: i64,
}

impl PgPeer {
    /// `election_interval` becomes the row's lease length; the incumbent
    /// refreshes well before it expires since `PeerHandle` ticks at
    /// `election_interval / boost`.
    pub fn new(
        pool: PgPool,
        notifier: Arc<dyn Notifier>,
        name: impl Into<String>,
        node: impl Into<String>,
        election_interval: Duration,
    ) -> Self {
        Self {
            pool,
            notifier,
            name: name.into(),
            node: node.into(),
            ttl_seconds: election_interval.as_secs().max(1) as i64,
        }
    }
}

#[async_trait]
impl Peer for PgPeer {
    fn instance_name(&self) -> &str {
        &self.name
    }

    async fn tick(&self) -> bool {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO oban_peers (name, node, started_at, expires_at)
            VALUES ($1, $2, now(), now() + $3 * interval '1 second')
            ON CONFLICT (name) DO UPDATE SET
                node = EXCLUDED.node,
                started_at = CASE WHEN oban_peers.node = EXCLUDED.node THEN oban_peers.started_at ELSE now() END,
                expires_at = EXCLUDED.expires_at
            WHERE oban_peers.node = $2 OR oban_peers.expires_at < now()
            RETURNING node
            "#,
        )
        .bind(&self.name)
        .bind(&self.node)
        .bind(self.ttl_seconds)
        .fetch_optional(&self.pool)
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(target: "oban::peer", error = %err, "election tick failed, assuming not leader");
            None
        });

        matches!(claimed, Some((node,)) if node == self.node)
    }

    async fn release(&self) {
        let result = sqlx::query("DELETE FROM oban_peers WHERE name = $1 AND node = $2")
            .bind(&self.name)
            .bind(&self.node)
            .execute(&self.pool)
            .await;

        match result {
            Ok(result) if result.rows_affected() > 0 => {
                self.notifier
                    .publish(Notification::Leader { down: self.name.clone() })
                    .await;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target: "oban::peer", error = %err, "failed to release peer claim");
            }
        }
    }
}
