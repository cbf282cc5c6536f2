//! Leader-only maintenance plugins: pruning, lifeline rescue, and index
//! maintenance.
//!
//! Each plugin is a small supervised loop gated on a `watch::Receiver<bool>`
//! from [`crate::peer::PeerHandle`]: it ticks on its own interval but only
//! does work while `*watch.borrow()` is `true`.

pub mod lifeline;
pub mod pruner;
pub mod reindexer;

pub use lifeline::Lifeline;
pub use pruner::Pruner;
pub use reindexer::{Reindexable, Reindexer};
