//! Persistent storage for events.
//!
//! The [`Backend`] trait abstracts the append-only event store plus its
//! pub/sub side. Two implementations are provided:
//!
//! - [`MemoryBackend`] — bounded in-memory log for development and tests
//! - [`PgBackend`] — durable append-only log on PostgreSQL
//!   (requires the `postgres` feature)
//!
//! Both preserve per-aggregate append order and deliver every appended
//! event to every matching active subscription.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod typed;

pub use memory::{MemoryBackend, MemoryBackendConfig};
#[cfg(feature = "postgres")]
pub use postgres::{PgBackend, PgBackendConfig};
pub use typed::{Invocations, Workflows};

use async_trait::async_trait;

use crate::error::Result;
use crate::event::{Aggregate, Event};
use crate::pubsub::{Selector, Subscription};

/// A matcher over aggregate kinds used by [`Backend::list`].
pub type KindMatcher<'a> = &'a (dyn Fn(&str) -> bool + Sync);

/// Append-only event store with per-aggregate ordering and pub/sub.
///
/// Appends are linearizable per aggregate: the backend assigns a contiguous
/// `sequence` starting at 0 and subscribers observe each aggregate's events
/// in append order. Across aggregates only publication order is observable.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Append an event, returning it with its assigned sequence.
    ///
    /// Fails with `InvalidAggregate`, `InvalidEvent`, or
    /// `EventStoreOverflow`.
    async fn append(&self, event: Event) -> Result<Event>;

    /// Fetch every event ever appended for an aggregate, in append order.
    /// Empty when the aggregate has no events.
    async fn get(&self, aggregate: &Aggregate) -> Result<Vec<Event>>;

    /// Enumerate aggregates whose kind matches the predicate. Order is
    /// unspecified; snapshot semantics are best-effort.
    async fn list(&self, matcher: KindMatcher<'_>) -> Result<Vec<Aggregate>>;

    /// Subscribe to appended events matching `selector`, buffered per
    /// subscriber. Overflow surfaces as a lagged marker in the stream.
    fn subscribe(&self, selector: Selector, buffer: usize) -> Subscription<Event>;
}
