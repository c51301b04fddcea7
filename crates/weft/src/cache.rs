//! Projected-entity cache with event-driven refresh and notifications.
//!
//! The cache keeps hot projections keyed by aggregate. Reads go through the
//! cache (`get` re-projects from the backend on a miss); a refresh worker
//! consumes the backend's event stream, applies each event to the affected
//! entity, and fans out a [`Notification`] to subscribers. Entries track the
//! next expected sequence so redelivered events are skipped and gaps trigger
//! a full re-projection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::entity::{Entity, ProjectedEntity};
use crate::error::{Error, Result};
use crate::event::{Aggregate, Event};
use crate::projector::project;
use crate::pubsub::{Delivery, Publisher, Selector, Subscription};
use crate::store::Backend;

/// A change notification emitted by the cache.
///
/// Carries a snapshot of the updated entity (a copy, never the live cache
/// reference), the triggering event's type and labels, and the trace
/// context extracted from the event metadata.
#[derive(Clone)]
pub struct Notification {
    /// Snapshot of the entity after the event was applied.
    pub entity: ProjectedEntity,
    /// The triggering event's type.
    pub event_type: String,
    /// The triggering event's labels, used for subscription matching.
    pub labels: BTreeMap<String, String>,
    /// Trace context carried in the event metadata.
    pub trace: BTreeMap<String, String>,
    /// When the triggering event was created.
    pub created_at: OffsetDateTime,
}

impl Notification {
    /// The aggregate of the updated entity.
    pub fn aggregate(&self) -> &Aggregate {
        self.entity.aggregate()
    }
}

struct CacheEntry {
    entity: ProjectedEntity,
    /// Next expected event sequence (== number of events applied).
    version: u64,
}

/// Write-through cache of projected entities with pub/sub notifications.
pub struct EntityCache {
    backend: Arc<dyn Backend>,
    entries: RwLock<HashMap<Aggregate, Arc<Mutex<CacheEntry>>>>,
    notifications: Publisher<Notification>,
    /// Event subscription opened at construction so nothing appended
    /// between construction and worker startup is missed.
    events: Mutex<Option<Subscription<Event>>>,
    buffer: usize,
}

impl EntityCache {
    /// Create a cache over a backend. `buffer` bounds each notification
    /// subscriber and the cache's own event subscription.
    pub fn new(backend: Arc<dyn Backend>, buffer: usize) -> Self {
        let events = backend.subscribe(Selector::any(), buffer);
        Self {
            backend,
            entries: RwLock::new(HashMap::new()),
            notifications: Publisher::new(),
            events: Mutex::new(Some(events)),
            buffer,
        }
    }

    /// Read-through fetch: return the cached projection, or project the
    /// aggregate's events from the backend and install the result.
    ///
    /// Fails with `EntityNotFound` when the aggregate has no events and
    /// `InvalidAggregate` when no entity factory covers its kind.
    pub async fn get(&self, aggregate: &Aggregate) -> Result<ProjectedEntity> {
        if let Some(entry) = self.lookup(aggregate) {
            let entry = entry.lock().expect("cache entry lock poisoned");
            return Ok(entry.entity.clone());
        }

        let entry = self.project_from_backend(aggregate).await?;
        let slot = self.install(aggregate, entry);
        let entry = slot.lock().expect("cache entry lock poisoned");
        Ok(entry.entity.clone())
    }

    /// Replace the cached projection for an entity's aggregate.
    ///
    /// The entry's version is preserved when present; an entry installed
    /// fresh starts at version 0 and self-heals through the next event's
    /// gap detection.
    pub fn put(&self, entity: ProjectedEntity) {
        let aggregate = entity.aggregate().clone();
        let mut entries = self.entries.write().expect("cache lock poisoned");
        match entries.get(&aggregate) {
            Some(slot) => {
                let mut entry = slot.lock().expect("cache entry lock poisoned");
                entry.entity = entity;
            }
            None => {
                entries.insert(
                    aggregate,
                    Arc::new(Mutex::new(CacheEntry { entity, version: 0 })),
                );
            }
        }
    }

    /// Drop the cached entry; the next `get` re-projects from the backend.
    pub fn invalidate(&self, aggregate: &Aggregate) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .remove(aggregate);
    }

    /// Snapshot of currently cached aggregates.
    pub fn list(&self) -> Vec<Aggregate> {
        self.entries
            .read()
            .expect("cache lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Subscribe to entity change notifications matching `selector`.
    pub fn subscribe(&self, selector: Selector) -> Subscription<Notification> {
        self.notifications.subscribe(selector, self.buffer)
    }

    /// Run the event-driven refresh worker until the shutdown signal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self
            .events
            .lock()
            .expect("cache subscription lock poisoned")
            .take()
            .unwrap_or_else(|| self.backend.subscribe(Selector::any(), self.buffer));
        info!("Entity cache refresh worker started");

        loop {
            tokio::select! {
                delivery = events.recv() => {
                    match delivery {
                        Some(Delivery::Message(event)) => self.apply_published(&event).await,
                        Some(Delivery::Lagged(n)) => {
                            warn!(dropped = n, "Cache event subscription lagged; invalidating");
                            self.entries.write().expect("cache lock poisoned").clear();
                        }
                        None => {
                            warn!("Backend event stream closed; cache refresh stopping");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Entity cache refresh worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn apply_published(&self, event: &Event) {
        let aggregate = &event.aggregate;
        let slot = match self.lookup(aggregate) {
            Some(slot) => slot,
            None => {
                // First sighting: project the full history, which already
                // includes this event.
                match self.project_from_backend(aggregate).await {
                    Ok(entry) => {
                        let slot = self.install(aggregate, entry);
                        self.notify(event, &slot);
                        return;
                    }
                    Err(err) => {
                        error!(aggregate = %aggregate, error = %err, "Failed to project aggregate");
                        return;
                    }
                }
            }
        };

        enum Applied {
            Skip,
            Notify,
            Gap,
        }

        // The entry lock is scoped so it is never held across an await.
        let applied = {
            let mut entry = slot.lock().expect("cache entry lock poisoned");
            if event.sequence < entry.version {
                debug!(
                    aggregate = %aggregate,
                    sequence = event.sequence,
                    version = entry.version,
                    "Skipping redelivered event"
                );
                Applied::Skip
            } else if event.sequence > entry.version {
                Applied::Gap
            } else {
                match entry.entity.apply_event(event) {
                    Ok(()) => {
                        entry.version += 1;
                        Applied::Notify
                    }
                    Err(err) if err.is_unsupported_event() => {
                        // The entity ignores the event but subscribers
                        // still get notified with the original type.
                        warn!(aggregate = %aggregate, event_type = %event.event_type, "Unsupported entity event");
                        entry.version += 1;
                        Applied::Notify
                    }
                    Err(err) => {
                        error!(
                            aggregate = %aggregate,
                            event_type = %event.event_type,
                            error = %err,
                            "Corrupted event payload; skipping"
                        );
                        entry.version += 1;
                        Applied::Skip
                    }
                }
            }
        };

        match applied {
            Applied::Skip => {}
            Applied::Notify => self.notify(event, &slot),
            Applied::Gap => {
                // Missed events; drop the entry and re-project.
                self.invalidate(aggregate);
                match self.project_from_backend(aggregate).await {
                    Ok(fresh) => {
                        let slot = self.install(aggregate, fresh);
                        self.notify(event, &slot);
                    }
                    Err(err) => {
                        error!(aggregate = %aggregate, error = %err, "Failed to re-project aggregate");
                    }
                }
            }
        }
    }

    fn notify(&self, event: &Event, slot: &Arc<Mutex<CacheEntry>>) {
        let entity = {
            let entry = slot.lock().expect("cache entry lock poisoned");
            entry.entity.clone()
        };
        let labels = event.labels();
        let notification = Notification {
            entity,
            event_type: event.event_type.clone(),
            labels: labels.clone(),
            trace: event.metadata.clone(),
            created_at: event.created_at,
        };
        self.notifications.publish(&labels, &notification);
    }

    fn lookup(&self, aggregate: &Aggregate) -> Option<Arc<Mutex<CacheEntry>>> {
        self.entries
            .read()
            .expect("cache lock poisoned")
            .get(aggregate)
            .cloned()
    }

    async fn project_from_backend(&self, aggregate: &Aggregate) -> Result<CacheEntry> {
        let events = self.backend.get(aggregate).await?;
        if events.is_empty() {
            return Err(Error::not_found(aggregate));
        }
        let mut entity = ProjectedEntity::from_aggregate(aggregate)?;
        project(&mut entity, &events)?;
        Ok(CacheEntry {
            entity,
            version: events.len() as u64,
        })
    }

    fn install(&self, aggregate: &Aggregate, entry: CacheEntry) -> Arc<Mutex<CacheEntry>> {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        Arc::clone(
            entries
                .entry(aggregate.clone())
                .or_insert_with(|| Arc::new(Mutex::new(entry))),
        )
    }
}
