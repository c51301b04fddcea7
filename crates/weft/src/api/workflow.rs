//! Workflow definition API: create (validate, parse, resolve) and delete.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::event::Event;
use crate::runtime::{FnRef, Registry};
use crate::store::Backend;
use crate::types::workflow::{WorkflowEvent, WorkflowSpec};

/// Creates and deletes workflow definitions.
///
/// `create` appends `WorkflowCreated`, then validates the graph and
/// resolves every task function; the outcome is a `WorkflowParsed` or
/// `WorkflowParsingFailed` event. A workflow that fails parsing exists but
/// never becomes ready.
#[derive(Clone)]
pub struct WorkflowApi {
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
}

impl WorkflowApi {
    /// Create the API over a backend and runtime registry.
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<Registry>) -> Self {
        Self { backend, registry }
    }

    /// Submit a workflow spec. Returns the new workflow id whether or not
    /// parsing succeeded; callers inspect the workflow status.
    pub async fn create(&self, spec: WorkflowSpec) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.create_with_id(&id, spec).await?;
        Ok(id)
    }

    /// Submit a workflow spec under a caller-chosen id.
    pub async fn create_with_id(&self, id: &str, spec: WorkflowSpec) -> Result<()> {
        self.append(
            WorkflowEvent::WorkflowCreated { spec: spec.clone() }.into_event(id)?,
        )
        .await?;

        match self.parse(&spec).await {
            Ok((resolved, output_task)) => {
                self.append(
                    WorkflowEvent::WorkflowParsed {
                        resolved,
                        output_task,
                    }
                    .into_event(id)?,
                )
                .await?;
                info!(workflow_id = %id, name = %spec.name, "Workflow ready");
            }
            Err(error) => {
                warn!(workflow_id = %id, name = %spec.name, error = %error, "Workflow parsing failed");
                self.append(WorkflowEvent::WorkflowParsingFailed { error }.into_event(id)?)
                    .await?;
            }
        }
        Ok(())
    }

    /// Delete a workflow definition.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.append(WorkflowEvent::WorkflowDeleted.into_event(id)?)
            .await?;
        Ok(())
    }

    /// Validate the graph and resolve every task function to exactly one
    /// runtime + fn-id pair.
    async fn parse(
        &self,
        spec: &WorkflowSpec,
    ) -> std::result::Result<(BTreeMap<String, FnRef>, Option<String>), String> {
        spec.validate_graph()?;

        let mut resolved = BTreeMap::new();
        for (task_id, task) in &spec.tasks {
            let fn_ref = self
                .registry
                .resolve(&task.function)
                .await
                .map_err(|err| format!("task {task_id}: {err}"))?;
            resolved.insert(task_id.clone(), fn_ref);
        }
        Ok((resolved, spec.effective_output_task()))
    }

    async fn append(&self, event: Event) -> Result<Event> {
        self.backend.append(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::cache::EntityCache;
    use crate::error::Result;
    use crate::runtime::FunctionResolver;
    use crate::store::{MemoryBackend, Workflows};
    use crate::types::workflow::{TaskSpec, WorkflowStatus};

    struct EchoResolver;

    #[async_trait]
    impl FunctionResolver for EchoResolver {
        async fn resolve(&self, name: &str) -> Result<Option<String>> {
            Ok((name == "echo").then(|| "fn-echo".to_owned()))
        }
    }

    fn harness() -> (WorkflowApi, Workflows) {
        let backend = Arc::new(MemoryBackend::new());
        let registry = Arc::new(Registry::new().with_resolver("native", Arc::new(EchoResolver)));
        let cache = Arc::new(EntityCache::new(backend.clone(), 16));
        (
            WorkflowApi::new(backend, registry),
            Workflows::new(cache),
        )
    }

    #[tokio::test]
    async fn create_parses_and_resolves() {
        let (api, workflows) = harness();
        let spec = WorkflowSpec::new("linear")
            .with_task("a", TaskSpec::new("echo"))
            .with_task("b", TaskSpec::new("echo").requires("a"));

        let id = api.create(spec).await.unwrap();
        let workflow = workflows.get_by_id(&id).await.unwrap();

        assert!(workflow.is_ready());
        assert_eq!(workflow.output_task.as_deref(), Some("b"));
        assert_eq!(workflow.resolved["a"].id, "fn-echo");
        assert_eq!(workflow.resolved["a"].runtime, "native");
    }

    #[tokio::test]
    async fn cyclic_spec_fails_at_parse_time() {
        let (api, workflows) = harness();
        let spec = WorkflowSpec::new("cyclic")
            .with_task("a", TaskSpec::new("echo").requires("b"))
            .with_task("b", TaskSpec::new("echo").requires("a"));

        let id = api.create(spec).await.unwrap();
        let workflow = workflows.get_by_id(&id).await.unwrap();

        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert!(workflow.error.as_deref().unwrap().contains("cycle"));
    }

    #[tokio::test]
    async fn unresolvable_function_fails_at_parse_time() {
        let (api, workflows) = harness();
        let spec = WorkflowSpec::new("ghostly").with_task("a", TaskSpec::new("ghost"));

        let id = api.create(spec).await.unwrap();
        let workflow = workflows.get_by_id(&id).await.unwrap();

        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert!(workflow.error.as_deref().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn delete_marks_workflow_deleted() {
        let (api, workflows) = harness();
        let id = api
            .create(WorkflowSpec::new("tiny").with_task("a", TaskSpec::new("echo")))
            .await
            .unwrap();

        api.delete(&id).await.unwrap();
        let workflow = workflows.get_by_id(&id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Deleted);
    }
}
