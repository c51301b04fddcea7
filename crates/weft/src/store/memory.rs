//! Bounded in-memory event backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::debug;

use super::{Backend, KindMatcher};
use crate::error::{Error, Result};
use crate::event::{Aggregate, Event};
use crate::pubsub::{Publisher, Selector, Subscription};

/// Capacity bounds for the in-memory backend.
#[derive(Debug, Clone)]
pub struct MemoryBackendConfig {
    /// Maximum events per aggregate before appends overflow.
    pub max_events_per_aggregate: usize,
    /// Maximum events across all aggregates before appends overflow.
    pub max_events_total: usize,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            max_events_per_aggregate: 1_000,
            max_events_total: 100_000,
        }
    }
}

/// Development and test backend: a per-aggregate ordered log in a map.
///
/// Appends serialize per aggregate (each stream has its own lock) and
/// proceed in parallel across aggregates. Events are published to
/// subscribers while the stream lock is held, so per-aggregate publication
/// order matches append order.
pub struct MemoryBackend {
    streams: RwLock<HashMap<Aggregate, Arc<Mutex<Vec<Event>>>>>,
    publisher: Publisher<Event>,
    total: AtomicUsize,
    config: MemoryBackendConfig,
}

impl MemoryBackend {
    /// A backend with default capacity bounds.
    pub fn new() -> Self {
        Self::with_config(MemoryBackendConfig::default())
    }

    /// A backend with explicit capacity bounds.
    pub fn with_config(config: MemoryBackendConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            publisher: Publisher::new(),
            total: AtomicUsize::new(0),
            config,
        }
    }

    fn stream(&self, aggregate: &Aggregate) -> Arc<Mutex<Vec<Event>>> {
        if let Some(stream) = self
            .streams
            .read()
            .expect("stream map lock poisoned")
            .get(aggregate)
        {
            return Arc::clone(stream);
        }
        let mut streams = self.streams.write().expect("stream map lock poisoned");
        Arc::clone(
            streams
                .entry(aggregate.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new()))),
        )
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn append(&self, mut event: Event) -> Result<Event> {
        event.validate()?;

        let stream = self.stream(&event.aggregate);
        let mut log = stream.lock().expect("stream lock poisoned");

        if log.len() >= self.config.max_events_per_aggregate
            || self.total.load(Ordering::Relaxed) >= self.config.max_events_total
        {
            return Err(Error::EventStoreOverflow {
                aggregate: event.aggregate.clone(),
            });
        }

        event.sequence = log.len() as u64;
        log.push(event.clone());
        self.total.fetch_add(1, Ordering::Relaxed);

        debug!(
            aggregate = %event.aggregate,
            event_type = %event.event_type,
            sequence = event.sequence,
            "Appended event"
        );

        // Published under the stream lock to keep per-aggregate order.
        self.publisher.publish(&event.labels(), &event);
        Ok(event)
    }

    async fn get(&self, aggregate: &Aggregate) -> Result<Vec<Event>> {
        aggregate.validate()?;
        let streams = self.streams.read().expect("stream map lock poisoned");
        match streams.get(aggregate) {
            Some(stream) => Ok(stream.lock().expect("stream lock poisoned").clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn list(&self, matcher: KindMatcher<'_>) -> Result<Vec<Aggregate>> {
        let streams = self.streams.read().expect("stream map lock poisoned");
        Ok(streams
            .keys()
            .filter(|aggregate| matcher(&aggregate.kind))
            .cloned()
            .collect())
    }

    fn subscribe(&self, selector: Selector, buffer: usize) -> Subscription<Event> {
        self.publisher.subscribe(selector, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::pubsub::Delivery;

    fn event(aggregate: &Aggregate, event_type: &str) -> Event {
        Event::new(aggregate.clone(), event_type, json!({}))
    }

    #[tokio::test]
    async fn append_assigns_contiguous_sequences() {
        let backend = MemoryBackend::new();
        let aggregate = Aggregate::invocation("inv-1");

        for expected in 0..3u64 {
            let appended = backend.append(event(&aggregate, "TaskStarted")).await.unwrap();
            assert_eq!(appended.sequence, expected);
        }

        let events = backend.get(&aggregate).await.unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn get_unknown_aggregate_is_empty() {
        let backend = MemoryBackend::new();
        let events = backend.get(&Aggregate::workflow("nope")).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn append_rejects_invalid_event() {
        let backend = MemoryBackend::new();
        let invalid = Event::new(Aggregate::new("", "x"), "T", json!({}));
        assert!(matches!(
            backend.append(invalid).await.unwrap_err(),
            Error::InvalidAggregate { .. }
        ));

        let no_type = Event::new(Aggregate::workflow("wf-1"), "", json!({}));
        assert!(matches!(
            backend.append(no_type).await.unwrap_err(),
            Error::InvalidEvent { .. }
        ));
    }

    #[tokio::test]
    async fn per_aggregate_capacity_overflows() {
        let backend = MemoryBackend::with_config(MemoryBackendConfig {
            max_events_per_aggregate: 2,
            max_events_total: 100,
        });
        let aggregate = Aggregate::invocation("inv-1");

        backend.append(event(&aggregate, "A")).await.unwrap();
        backend.append(event(&aggregate, "B")).await.unwrap();
        let err = backend.append(event(&aggregate, "C")).await.unwrap_err();
        assert!(matches!(err, Error::EventStoreOverflow { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_kind() {
        let backend = MemoryBackend::new();
        backend
            .append(event(&Aggregate::workflow("wf-1"), "WorkflowCreated"))
            .await
            .unwrap();
        backend
            .append(event(&Aggregate::invocation("inv-1"), "InvocationCreated"))
            .await
            .unwrap();

        let invocations = backend.list(&|kind| kind == "invocation").await.unwrap();
        assert_eq!(invocations, vec![Aggregate::invocation("inv-1")]);
    }

    #[tokio::test]
    async fn subscribers_observe_append_order() {
        let backend = MemoryBackend::new();
        let aggregate = Aggregate::invocation("inv-1");
        let mut sub = backend.subscribe(Selector::aggregate(&aggregate), 16);

        for event_type in ["InvocationCreated", "TaskStarted", "TaskSucceeded"] {
            backend.append(event(&aggregate, event_type)).await.unwrap();
        }

        for expected in ["InvocationCreated", "TaskStarted", "TaskSucceeded"] {
            match sub.recv().await {
                Some(Delivery::Message(e)) => assert_eq!(e.event_type, expected),
                other => panic!("expected message, got lag/close: {:?}", other.is_some()),
            }
        }
    }

    #[tokio::test]
    async fn appends_to_distinct_aggregates_run_in_parallel() {
        let backend = Arc::new(MemoryBackend::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                let aggregate = Aggregate::invocation(format!("inv-{i}"));
                for _ in 0..10 {
                    backend.append(event(&aggregate, "Tick")).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..8 {
            let events = backend
                .get(&Aggregate::invocation(format!("inv-{i}")))
                .await
                .unwrap();
            let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
            assert_eq!(sequences, (0..10).collect::<Vec<u64>>());
        }
    }
}
