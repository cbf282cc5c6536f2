//! PostgreSQL adapter for `oban-core`: a `JobStore`, a `Notifier`, and a
//! `Peer` built on the same connection pool.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE oban_jobs (
//!     id BIGSERIAL PRIMARY KEY,
//!     state TEXT NOT NULL DEFAULT 'available',
//!     queue TEXT NOT NULL DEFAULT 'default',
//!     worker TEXT NOT NULL,
//!     args JSONB NOT NULL DEFAULT '{}',
//!     meta JSONB NOT NULL DEFAULT '{}',
//!     tags TEXT[] NOT NULL DEFAULT '{}',
//!     errors JSONB NOT NULL DEFAULT '[]',
//!     attempt INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL DEFAULT 20,
//!     priority INTEGER NOT NULL DEFAULT 0,
//!     inserted_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     scheduled_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     attempted_at TIMESTAMPTZ,
//!     attempted_by TEXT[] NOT NULL DEFAULT '{}',
//!     completed_at TIMESTAMPTZ,
//!     cancelled_at TIMESTAMPTZ,
//!     discarded_at TIMESTAMPTZ
//! );
//!
//! CREATE TABLE oban_peers (
//!     name TEXT PRIMARY KEY,
//!     node TEXT NOT NULL,
//!     started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     expires_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! See `migrations/0001_init.sql` for the full DDL including indexes.
//!
//! # Components
//!
//! - [`PgJobStore`] — every [`oban_core::store::JobStore`] transition as
//!   one atomic statement, claims under `FOR UPDATE SKIP LOCKED`.
//! - [`PgNotifier`] — LISTEN/NOTIFY via `sqlx::postgres::PgListener`,
//!   namespaced by a `prefix` so multiple applications can share a
//!   database without colliding on channel names.
//! - [`PgPeer`] — the DB-row leader election strategy.
//! - `PgJobStore` also implements [`oban_core::plugins::Reindexable`] for
//!   the periodic index-bloat maintenance plugin.
//!
//! # Example
//!
//! ```ignore
//! use oban_postgres::{PgJobStore, PgNotifier, PgPeer};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let pool = sqlx::PgPool::connect("postgres://localhost/oban_dev").await?;
//! let store = Arc::new(PgJobStore::new(pool.clone()));
//! let notifier = PgNotifier::connect(pool.clone(), "public").await?;
//! let peer = Arc::new(PgPeer::new(
//!     pool.clone(),
//!     notifier.clone(),
//!     "oban",
//!     "worker-1",
//!     Duration::from_secs(30),
//! ));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod notifier;
mod peer;
mod store;

pub use notifier::PgNotifier;
pub use peer::PgPeer;
pub use store::PgJobStore;
