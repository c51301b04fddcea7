//! Invocation API: create, cancel, and the controller-side appenders.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{Aggregate, Event};
use crate::store::{Backend, Invocations, Workflows};
use crate::types::invocation::{InvocationEntity, InvocationEvent};
use crate::value::ValueMap;

/// Writes invocation lifecycle events.
///
/// `invoke` and `cancel` serve external callers; `complete`, `fail`, and
/// `abort` are appended by the controller. Every write is an event: the
/// API never mutates entity state directly.
#[derive(Clone)]
pub struct InvocationApi {
    backend: Arc<dyn Backend>,
    workflows: Workflows,
    invocations: Invocations,
    default_deadline: Option<std::time::Duration>,
}

impl InvocationApi {
    /// Create the API over a backend and the typed stores.
    pub fn new(backend: Arc<dyn Backend>, workflows: Workflows, invocations: Invocations) -> Self {
        Self {
            backend,
            workflows,
            invocations,
            default_deadline: None,
        }
    }

    /// Apply a default deadline to invocations created without one.
    pub fn with_default_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }

    /// Create an invocation of a ready workflow. Returns the invocation id.
    pub async fn invoke(&self, workflow_id: &str, inputs: ValueMap) -> Result<String> {
        let deadline = self
            .default_deadline
            .map(|d| OffsetDateTime::now_utc() + d);
        self.invoke_with(workflow_id, inputs, None, deadline).await
    }

    /// Create an invocation with a parent (sub-workflow) and/or deadline.
    pub async fn invoke_with(
        &self,
        workflow_id: &str,
        inputs: ValueMap,
        parent: Option<Aggregate>,
        deadline: Option<OffsetDateTime>,
    ) -> Result<String> {
        let workflow = self.workflows.get_by_id(workflow_id).await?;
        if !workflow.is_ready() {
            return Err(Error::WorkflowNotReady {
                id: workflow_id.to_owned(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let mut event = InvocationEvent::InvocationCreated {
            workflow_id: workflow_id.to_owned(),
            inputs,
            parent: parent.clone(),
            deadline,
        }
        .into_event(&id)?;
        if let Some(parent) = parent {
            event = event.with_parent(parent);
        }
        self.backend.append(event).await?;
        info!(invocation_id = %id, workflow_id = %workflow_id, "Invocation created");
        Ok(id)
    }

    /// Request cancellation; honored by the next reconciliation.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        // Existence check so a typo does not seed a dangling aggregate.
        self.invocations.get_by_id(id).await?;
        self.backend
            .append(InvocationEvent::InvocationCancelRequested.into_event(id)?)
            .await?;
        Ok(())
    }

    /// Record successful completion with the final output.
    pub async fn complete(&self, invocation: &InvocationEntity, output: ValueMap) -> Result<()> {
        self.append_for(
            invocation,
            InvocationEvent::InvocationCompleted { output }.into_event(invocation.id())?,
        )
        .await
    }

    /// Record invocation-level failure.
    pub async fn fail(&self, invocation: &InvocationEntity, error: impl Into<String>) -> Result<()> {
        self.append_for(
            invocation,
            InvocationEvent::InvocationFailed {
                error: error.into(),
            }
            .into_event(invocation.id())?,
        )
        .await
    }

    /// Record a task success on the controller's behalf: completes the
    /// waiting parent of a settled dynamic expansion.
    pub async fn complete_task(
        &self,
        invocation: &InvocationEntity,
        task_id: &str,
        output: ValueMap,
    ) -> Result<()> {
        self.append_for(
            invocation,
            InvocationEvent::TaskSucceeded {
                task_id: task_id.to_owned(),
                output,
            }
            .into_event(invocation.id())?,
        )
        .await
    }

    /// Record a task failure on the controller's behalf: fails the waiting
    /// parent of a dynamic expansion whose child failed.
    pub async fn fail_task(
        &self,
        invocation: &InvocationEntity,
        task_id: &str,
        error: impl Into<String>,
    ) -> Result<()> {
        self.append_for(
            invocation,
            InvocationEvent::TaskFailed {
                task_id: task_id.to_owned(),
                error: error.into(),
                retryable: false,
            }
            .into_event(invocation.id())?,
        )
        .await
    }

    /// Record an abort (cancellation or deadline expiry).
    pub async fn abort(&self, invocation: &InvocationEntity, reason: impl Into<String>) -> Result<()> {
        self.append_for(
            invocation,
            InvocationEvent::InvocationAborted {
                reason: reason.into(),
            }
            .into_event(invocation.id())?,
        )
        .await
    }

    /// Append with parent fan-out when the invocation has a parent.
    async fn append_for(&self, invocation: &InvocationEntity, mut event: Event) -> Result<()> {
        if let Some(parent) = &invocation.parent {
            event = event.with_parent(parent.clone());
        }
        self.backend.append(event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::api::WorkflowApi;
    use crate::cache::EntityCache;
    use crate::runtime::{FunctionResolver, Registry};
    use crate::store::MemoryBackend;
    use crate::types::invocation::InvocationStatus;
    use crate::types::workflow::{TaskSpec, WorkflowSpec};

    struct EchoResolver;

    #[async_trait]
    impl FunctionResolver for EchoResolver {
        async fn resolve(&self, name: &str) -> Result<Option<String>> {
            Ok((name == "echo").then(|| "fn-echo".to_owned()))
        }
    }

    struct Harness {
        workflow_api: WorkflowApi,
        invocation_api: InvocationApi,
        invocations: Invocations,
        cache: Arc<EntityCache>,
    }

    fn harness() -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let registry = Arc::new(Registry::new().with_resolver("native", Arc::new(EchoResolver)));
        let cache = Arc::new(EntityCache::new(backend.clone(), 16));
        let workflows = Workflows::new(Arc::clone(&cache));
        let invocations = Invocations::new(Arc::clone(&cache));
        Harness {
            workflow_api: WorkflowApi::new(backend.clone(), registry),
            invocation_api: InvocationApi::new(backend, workflows, invocations.clone()),
            invocations,
            cache,
        }
    }

    #[tokio::test]
    async fn invoke_requires_ready_workflow() {
        let h = harness();
        let wf = h
            .workflow_api
            .create(WorkflowSpec::new("w").with_task("a", TaskSpec::new("echo")))
            .await
            .unwrap();

        let id = h.invocation_api.invoke(&wf, ValueMap::new()).await.unwrap();
        let invocation = h.invocations.get_by_id(&id).await.unwrap();
        assert_eq!(invocation.status, InvocationStatus::Scheduled);
        assert_eq!(invocation.workflow_id, wf);
    }

    #[tokio::test]
    async fn invoke_rejects_failed_workflow() {
        let h = harness();
        let wf = h
            .workflow_api
            .create(WorkflowSpec::new("w").with_task("a", TaskSpec::new("ghost")))
            .await
            .unwrap();

        let err = h
            .invocation_api
            .invoke(&wf, ValueMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkflowNotReady { .. }));
    }

    #[tokio::test]
    async fn cancel_unknown_invocation_fails() {
        let h = harness();
        let err = h.invocation_api.cancel("ghost").await.unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_sets_flag() {
        let h = harness();
        let wf = h
            .workflow_api
            .create(WorkflowSpec::new("w").with_task("a", TaskSpec::new("echo")))
            .await
            .unwrap();
        let id = h.invocation_api.invoke(&wf, ValueMap::new()).await.unwrap();

        h.invocation_api.cancel(&id).await.unwrap();

        // No refresh worker in this test; drop the stale entry and re-read.
        h.cache.invalidate(&Aggregate::invocation(id.as_str()));
        let invocation = h.invocations.get_by_id(&id).await.unwrap();
        assert!(invocation.cancel_requested);
    }
}
