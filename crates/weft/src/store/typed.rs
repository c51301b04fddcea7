//! Typed read façades over the entity cache.
//!
//! `Workflows` and `Invocations` expose typed snapshots of their aggregate
//! kind. They never write: all writes go through the domain APIs, which
//! append events to the backend.

use std::sync::Arc;

use crate::cache::{EntityCache, Notification};
use crate::error::Result;
use crate::event::{Aggregate, INVOCATION_KIND, WORKFLOW_KIND};
use crate::pubsub::{Selector, Subscription};
use crate::types::invocation::InvocationEntity;
use crate::types::workflow::WorkflowEntity;

/// Typed store for workflow definitions.
#[derive(Clone)]
pub struct Workflows {
    cache: Arc<EntityCache>,
}

impl Workflows {
    /// Wrap a cache.
    pub fn new(cache: Arc<EntityCache>) -> Self {
        Self { cache }
    }

    /// Snapshot of a workflow by id.
    pub async fn get_by_id(&self, id: &str) -> Result<WorkflowEntity> {
        self.cache
            .get(&Aggregate::workflow(id))
            .await?
            .into_workflow()
    }

    /// Ids of currently cached workflows.
    pub fn list(&self) -> Vec<String> {
        self.cache
            .list()
            .into_iter()
            .filter(|a| a.kind == WORKFLOW_KIND)
            .map(|a| a.id)
            .collect()
    }

    /// Subscribe to workflow change notifications.
    pub fn subscribe(&self) -> Subscription<Notification> {
        self.cache.subscribe(Selector::kind(WORKFLOW_KIND))
    }
}

/// Typed store for workflow invocations.
#[derive(Clone)]
pub struct Invocations {
    cache: Arc<EntityCache>,
}

impl Invocations {
    /// Wrap a cache.
    pub fn new(cache: Arc<EntityCache>) -> Self {
        Self { cache }
    }

    /// Snapshot of an invocation by id.
    pub async fn get_by_id(&self, id: &str) -> Result<InvocationEntity> {
        self.cache
            .get(&Aggregate::invocation(id))
            .await?
            .into_invocation()
    }

    /// Ids of currently cached invocations.
    pub fn list(&self) -> Vec<String> {
        self.cache
            .list()
            .into_iter()
            .filter(|a| a.kind == INVOCATION_KIND)
            .map(|a| a.id)
            .collect()
    }

    /// Subscribe to change notifications for every invocation.
    pub fn subscribe(&self) -> Subscription<Notification> {
        self.cache.subscribe(Selector::kind(INVOCATION_KIND))
    }

    /// Subscribe to change notifications for one invocation, the shape
    /// consumed by event-stream endpoints.
    pub fn subscribe_one(&self, id: &str) -> Subscription<Notification> {
        self.cache
            .subscribe(Selector::aggregate(&Aggregate::invocation(id)))
    }
}
