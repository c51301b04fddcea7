//! Task API: executes a single task dispatch.
//!
//! One dispatch resolves the task's inputs from the invocation snapshot,
//! appends `TaskStarted`, calls the runtime, and records the outcome as
//! `TaskSucceeded`, `TasksAdded` (dynamic expansion), or `TaskFailed`.
//! Transport errors and panicked runtime calls become retryable
//! `TaskFailed` events. The Task API never retries on its own; the
//! controller is the sole retry authority.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::runtime::{FnRef, Invoked, Registry, RuntimeError};
use crate::store::Backend;
use crate::types::invocation::{InvocationEntity, InvocationEvent};
use crate::types::workflow::{TaskSpec, WorkflowEntity};
use crate::value::resolve_inputs;

/// Dispatches single tasks to function runtimes and records the outcome.
#[derive(Clone)]
pub struct TaskApi {
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
}

impl TaskApi {
    /// Create the API over a backend and runtime registry.
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<Registry>) -> Self {
        Self { backend, registry }
    }

    /// Execute one task of an invocation.
    ///
    /// Returns an error only when the dispatch could not be recorded
    /// (unknown task, append failure); runtime failures are recorded as
    /// `TaskFailed` events and reported as `Ok`.
    pub async fn run(
        &self,
        invocation: &InvocationEntity,
        workflow: &WorkflowEntity,
        task_id: &str,
    ) -> Result<()> {
        let (spec, fn_ref) = self.locate(invocation, workflow, task_id).await?;

        let inputs = resolve_inputs(&spec.inputs, &invocation.inputs, |task| {
            invocation.task_output(task)
        })?;

        self.append_for(
            invocation,
            InvocationEvent::TaskStarted {
                task_id: task_id.to_owned(),
            }
            .into_event(invocation.id())?,
        )
        .await?;

        debug!(
            invocation_id = %invocation.id(),
            task_id = %task_id,
            function = %fn_ref,
            "Dispatching task"
        );

        let outcome = self.invoke(&fn_ref, inputs, invocation.deadline).await;

        let event = match outcome {
            Ok(Invoked::Output(output)) => InvocationEvent::TaskSucceeded {
                task_id: task_id.to_owned(),
                output,
            },
            Ok(Invoked::Expansion(expansion)) => InvocationEvent::TasksAdded {
                parent_task: task_id.to_owned(),
                expansion,
            },
            Err(err) => {
                warn!(
                    invocation_id = %invocation.id(),
                    task_id = %task_id,
                    error = %err,
                    retryable = err.retryable,
                    "Task failed"
                );
                InvocationEvent::TaskFailed {
                    task_id: task_id.to_owned(),
                    error: err.message,
                    retryable: err.retryable,
                }
            }
        };
        self.append_for(invocation, event.into_event(invocation.id())?)
            .await?;
        Ok(())
    }

    /// Pre-warm a task's function. Best-effort: failures are logged, never
    /// surfaced.
    pub async fn prepare(
        &self,
        workflow: &WorkflowEntity,
        task_id: &str,
        expected_at: OffsetDateTime,
    ) {
        let Some(fn_ref) = workflow.resolved.get(task_id) else {
            return;
        };
        match self.registry.runtime(&fn_ref.runtime) {
            Ok(runtime) => runtime.prepare(fn_ref, expected_at).await,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "Prepare skipped: runtime missing");
            }
        }
    }

    /// Find the task spec and its function ref. Static tasks were resolved
    /// at parse time; dynamic tasks resolve at dispatch time.
    async fn locate<'a>(
        &self,
        invocation: &'a InvocationEntity,
        workflow: &'a WorkflowEntity,
        task_id: &str,
    ) -> Result<(&'a TaskSpec, FnRef)> {
        if let Some(dynamic) = invocation.dynamic_tasks.get(task_id) {
            let fn_ref = self.registry.resolve(&dynamic.spec.function).await?;
            return Ok((&dynamic.spec, fn_ref));
        }
        let spec = workflow.task(task_id).ok_or_else(|| Error::UnknownTask {
            invocation: invocation.id().to_owned(),
            task: task_id.to_owned(),
        })?;
        let fn_ref = workflow
            .resolved
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::UnknownTask {
                invocation: invocation.id().to_owned(),
                task: task_id.to_owned(),
            })?;
        Ok((spec, fn_ref))
    }

    /// Call the runtime on its own task so a panic surfaces as a transport
    /// error instead of tearing down the reconciliation.
    async fn invoke(
        &self,
        fn_ref: &FnRef,
        inputs: crate::value::ValueMap,
        deadline: Option<OffsetDateTime>,
    ) -> std::result::Result<Invoked, RuntimeError> {
        let runtime = self
            .registry
            .runtime(&fn_ref.runtime)
            .map_err(|err| RuntimeError::transport(err.to_string()))?;
        let fn_ref = fn_ref.clone();
        let handle =
            tokio::spawn(async move { runtime.invoke(&fn_ref, inputs, deadline).await });
        match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(RuntimeError::transport(format!(
                "runtime call did not complete: {join_err}"
            ))),
        }
    }

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
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use nonempty::NonEmpty;
    use serde_json::json;

    use crate::entity::Entity;
    use crate::runtime::FunctionRuntime;
    use crate::store::MemoryBackend;
    use crate::types::invocation::{DynamicExpansion, NamedTask};
    use crate::types::workflow::{WorkflowEvent, WorkflowSpec};
    use crate::value::{InputSpec, TypedValue, ValueMap};

    #[derive(Debug)]
    struct EchoRuntime;

    #[async_trait]
    impl FunctionRuntime for EchoRuntime {
        async fn invoke(
            &self,
            _fn_ref: &FnRef,
            inputs: ValueMap,
            _deadline: Option<OffsetDateTime>,
        ) -> std::result::Result<Invoked, RuntimeError> {
            Ok(Invoked::Output(inputs))
        }
    }

    #[derive(Debug)]
    struct FailingRuntime;

    #[async_trait]
    impl FunctionRuntime for FailingRuntime {
        async fn invoke(
            &self,
            _fn_ref: &FnRef,
            _inputs: ValueMap,
            _deadline: Option<OffsetDateTime>,
        ) -> std::result::Result<Invoked, RuntimeError> {
            Err(RuntimeError::function("boom"))
        }
    }

    #[derive(Debug)]
    struct PanickingRuntime;

    #[async_trait]
    impl FunctionRuntime for PanickingRuntime {
        async fn invoke(
            &self,
            _fn_ref: &FnRef,
            _inputs: ValueMap,
            _deadline: Option<OffsetDateTime>,
        ) -> std::result::Result<Invoked, RuntimeError> {
            panic!("runtime crashed");
        }
    }

    #[derive(Debug)]
    struct ExpandingRuntime;

    #[async_trait]
    impl FunctionRuntime for ExpandingRuntime {
        async fn invoke(
            &self,
            _fn_ref: &FnRef,
            _inputs: ValueMap,
            _deadline: Option<OffsetDateTime>,
        ) -> std::result::Result<Invoked, RuntimeError> {
            Ok(Invoked::Expansion(DynamicExpansion {
                tasks: NonEmpty::new(NamedTask {
                    id: "a.1".to_owned(),
                    spec: TaskSpec::new("native://echo"),
                }),
                edges: Vec::new(),
            }))
        }
    }

    struct EchoResolver;

    #[async_trait]
    impl crate::runtime::FunctionResolver for EchoResolver {
        async fn resolve(&self, name: &str) -> Result<Option<String>> {
            Ok((name == "echo").then(|| "fn-echo".to_owned()))
        }
    }

    fn workflow_with(fn_runtime: &str) -> WorkflowEntity {
        let spec = WorkflowSpec::new("one").with_task(
            "a",
            TaskSpec::new("echo").with_input(
                "x",
                InputSpec::Invocation {
                    field: Some("x".to_owned()),
                    path: None,
                },
            ),
        );
        let mut wf = WorkflowEntity::new("wf-1");
        wf.apply_event(
            &WorkflowEvent::WorkflowCreated { spec }
                .into_event("wf-1")
                .unwrap(),
        )
        .unwrap();
        wf.apply_event(
            &WorkflowEvent::WorkflowParsed {
                resolved: BTreeMap::from([("a".to_owned(), FnRef::new(fn_runtime, "fn-echo"))]),
                output_task: Some("a".to_owned()),
            }
            .into_event("wf-1")
            .unwrap(),
        )
        .unwrap();
        wf
    }

    fn invocation() -> InvocationEntity {
        let mut inv = InvocationEntity::new("inv-1");
        inv.apply_event(
            &InvocationEvent::InvocationCreated {
                workflow_id: "wf-1".to_owned(),
                inputs: ValueMap::from([("x".to_owned(), TypedValue::json(json!(1)))]),
                parent: None,
                deadline: None,
            }
            .into_event("inv-1")
            .unwrap(),
        )
        .unwrap();
        inv
    }

    async fn event_types(backend: &MemoryBackend, id: &str) -> Vec<String> {
        backend
            .get(&crate::Aggregate::invocation(id))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    fn api(backend: Arc<MemoryBackend>, runtime: Arc<dyn FunctionRuntime>) -> TaskApi {
        let registry = Arc::new(
            Registry::new()
                .with_runtime("native", runtime)
                .with_resolver("native", Arc::new(EchoResolver)),
        );
        TaskApi::new(backend, registry)
    }

    #[tokio::test]
    async fn successful_dispatch_records_started_then_succeeded() {
        let backend = Arc::new(MemoryBackend::new());
        let api = api(backend.clone(), Arc::new(EchoRuntime));

        api.run(&invocation(), &workflow_with("native"), "a")
            .await
            .unwrap();

        assert_eq!(
            event_types(&backend, "inv-1").await,
            vec!["TaskStarted", "TaskSucceeded"]
        );
        let events = backend
            .get(&crate::Aggregate::invocation("inv-1"))
            .await
            .unwrap();
        let decoded = InvocationEvent::from_event(&events[1]).unwrap();
        match decoded {
            InvocationEvent::TaskSucceeded { output, .. } => {
                assert_eq!(output["x"].value, json!(1));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn runtime_failure_records_task_failed() {
        let backend = Arc::new(MemoryBackend::new());
        let api = api(backend.clone(), Arc::new(FailingRuntime));

        api.run(&invocation(), &workflow_with("native"), "a")
            .await
            .unwrap();

        assert_eq!(
            event_types(&backend, "inv-1").await,
            vec!["TaskStarted", "TaskFailed"]
        );
    }

    #[tokio::test]
    async fn panic_becomes_retryable_task_failed() {
        let backend = Arc::new(MemoryBackend::new());
        let api = api(backend.clone(), Arc::new(PanickingRuntime));

        api.run(&invocation(), &workflow_with("native"), "a")
            .await
            .unwrap();

        let events = backend
            .get(&crate::Aggregate::invocation("inv-1"))
            .await
            .unwrap();
        match InvocationEvent::from_event(&events[1]).unwrap() {
            InvocationEvent::TaskFailed { retryable, .. } => assert!(retryable),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn expansion_records_tasks_added() {
        let backend = Arc::new(MemoryBackend::new());
        let api = api(backend.clone(), Arc::new(ExpandingRuntime));

        api.run(&invocation(), &workflow_with("native"), "a")
            .await
            .unwrap();

        assert_eq!(
            event_types(&backend, "inv-1").await,
            vec!["TaskStarted", "TasksAdded"]
        );
    }

    #[tokio::test]
    async fn unknown_task_is_an_error() {
        let backend = Arc::new(MemoryBackend::new());
        let api = api(backend.clone(), Arc::new(EchoRuntime));

        let err = api
            .run(&invocation(), &workflow_with("native"), "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTask { .. }));
        assert!(event_types(&backend, "inv-1").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_runtime_records_transport_failure() {
        let backend = Arc::new(MemoryBackend::new());
        let api = api(backend.clone(), Arc::new(EchoRuntime));

        // The workflow resolved to a runtime that is not registered.
        api.run(&invocation(), &workflow_with("faas"), "a")
            .await
            .unwrap();

        let events = backend
            .get(&crate::Aggregate::invocation("inv-1"))
            .await
            .unwrap();
        match InvocationEvent::from_event(&events[1]).unwrap() {
            InvocationEvent::TaskFailed { retryable, .. } => assert!(retryable),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
