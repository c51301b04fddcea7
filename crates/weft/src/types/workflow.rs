//! The workflow definition entity.
//!
//! A workflow is a DAG of tasks. It enters the system as a spec
//! (`WorkflowCreated`), is validated and resolved against the function
//! runtimes (`WorkflowParsed` / `WorkflowParsingFailed`), and once ready its
//! task graph is immutable: every referenced function resolves to exactly
//! one runtime + fn-id pair.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::event::{Aggregate, Event};
use crate::runtime::FnRef;
use crate::value::InputSpec;

/// Lifecycle of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but not yet parsed.
    Pending,
    /// Parsed and resolved; invocations may be created against it.
    Ready,
    /// Parsing or resolution failed; the workflow never becomes ready.
    Failed,
    /// Deleted by the caller.
    Deleted,
}

/// One task in a workflow spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// The function to invoke, resolved through the runtime registry.
    pub function: String,
    /// Ids of tasks that must succeed before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Input expressions, evaluated right before dispatch.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputSpec>,
    /// An optional task's failure does not fail the invocation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl TaskSpec {
    /// A task spec with no dependencies and no inputs.
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            requires: Vec::new(),
            inputs: BTreeMap::new(),
            optional: false,
        }
    }

    /// Add a dependency.
    pub fn requires(mut self, task: impl Into<String>) -> Self {
        self.requires.push(task.into());
        self
    }

    /// Add an input expression.
    pub fn with_input(mut self, name: impl Into<String>, spec: InputSpec) -> Self {
        self.inputs.insert(name.into(), spec);
        self
    }

    /// Mark the task optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A workflow definition as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Human-readable name.
    pub name: String,
    /// Task graph keyed by task id.
    pub tasks: BTreeMap<String, TaskSpec>,
    /// The task whose output becomes the invocation output. When absent the
    /// unique sink of the graph is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_task: Option<String>,
}

impl WorkflowSpec {
    /// A spec with the given name and no tasks.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: BTreeMap::new(),
            output_task: None,
        }
    }

    /// Add a task.
    pub fn with_task(mut self, id: impl Into<String>, spec: TaskSpec) -> Self {
        self.tasks.insert(id.into(), spec);
        self
    }

    /// Validate the task graph: dependency references must exist and the
    /// graph must be acyclic.
    pub fn validate_graph(&self) -> std::result::Result<(), String> {
        if let Some(output) = &self.output_task {
            if !self.tasks.contains_key(output) {
                return Err(format!("output task {output} does not exist"));
            }
        }
        for (id, task) in &self.tasks {
            for dep in &task.requires {
                if dep == id {
                    return Err(format!("task {id} depends on itself"));
                }
                if !self.tasks.contains_key(dep) {
                    return Err(format!("task {id} depends on unknown task {dep}"));
                }
            }
            let mut seen = BTreeSet::new();
            for dep in &task.requires {
                if !seen.insert(dep.as_str()) {
                    return Err(format!("task {id} depends on {dep} more than once"));
                }
            }
        }

        // Kahn's algorithm; any unvisited task implies a cycle.
        let mut indegree: BTreeMap<&str, usize> = self
            .tasks
            .iter()
            .map(|(id, task)| (id.as_str(), task.requires.len()))
            .collect();
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for (next, task) in &self.tasks {
                if task.requires.iter().any(|dep| dep.as_str() == id) {
                    let deg = indegree.get_mut(next.as_str()).expect("task indexed");
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }
        if visited != self.tasks.len() {
            return Err("task graph contains a dependency cycle".to_owned());
        }
        Ok(())
    }

    /// The effective output task: the explicit one, or the unique sink of
    /// the graph (the task no other task requires). `None` when the graph
    /// is empty or has several sinks.
    pub fn effective_output_task(&self) -> Option<String> {
        if self.output_task.is_some() {
            return self.output_task.clone();
        }
        let required: BTreeSet<&str> = self
            .tasks
            .values()
            .flat_map(|t| t.requires.iter().map(String::as_str))
            .collect();
        let mut sinks = self
            .tasks
            .keys()
            .filter(|id| !required.contains(id.as_str()));
        let first = sinks.next()?;
        match sinks.next() {
            None => Some(first.clone()),
            Some(_) => None,
        }
    }
}

/// Events of the workflow aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkflowEvent {
    /// A spec was submitted.
    WorkflowCreated {
        /// The submitted spec.
        spec: WorkflowSpec,
    },
    /// The spec was validated and every function was resolved.
    WorkflowParsed {
        /// Resolved function refs keyed by task id.
        resolved: BTreeMap<String, FnRef>,
        /// The effective output task.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_task: Option<String>,
    },
    /// Validation or resolution failed; the workflow never becomes ready.
    WorkflowParsingFailed {
        /// Why parsing failed.
        error: String,
    },
    /// The workflow was deleted.
    WorkflowDeleted,
}

impl WorkflowEvent {
    /// The event type string stored on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowCreated { .. } => "WorkflowCreated",
            WorkflowEvent::WorkflowParsed { .. } => "WorkflowParsed",
            WorkflowEvent::WorkflowParsingFailed { .. } => "WorkflowParsingFailed",
            WorkflowEvent::WorkflowDeleted => "WorkflowDeleted",
        }
    }

    /// Wrap into an [`Event`] for the workflow aggregate `id`.
    pub fn into_event(self, id: &str) -> Result<Event> {
        let event_type = self.event_type();
        let payload = serde_json::to_value(&self)?;
        Ok(Event::new(Aggregate::workflow(id), event_type, payload))
    }

    fn is_known(event_type: &str) -> bool {
        matches!(
            event_type,
            "WorkflowCreated" | "WorkflowParsed" | "WorkflowParsingFailed" | "WorkflowDeleted"
        )
    }

    /// Decode a raw event, distinguishing unknown types from bad payloads.
    pub fn from_event(event: &Event) -> Result<Self> {
        if !Self::is_known(&event.event_type) {
            return Err(Error::unsupported_event(&event.aggregate, &event.event_type));
        }
        serde_json::from_value(event.payload.clone())
            .map_err(|e| Error::corrupted_payload(&event.aggregate, &event.event_type, e))
    }
}

/// The projected workflow entity.
#[derive(Debug, Clone)]
pub struct WorkflowEntity {
    aggregate: Aggregate,
    /// Current lifecycle status.
    pub status: WorkflowStatus,
    /// The submitted spec, present after `WorkflowCreated`.
    pub spec: Option<WorkflowSpec>,
    /// Resolved function refs keyed by task id, present once ready.
    pub resolved: BTreeMap<String, FnRef>,
    /// The effective output task, present once ready.
    pub output_task: Option<String>,
    /// Parsing error, present when status is failed.
    pub error: Option<String>,
    /// When the workflow was created.
    pub created_at: OffsetDateTime,
}

impl WorkflowEntity {
    /// An empty pending entity for projection.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            aggregate: Aggregate::workflow(id),
            status: WorkflowStatus::Pending,
            spec: None,
            resolved: BTreeMap::new(),
            output_task: None,
            error: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    /// The workflow id.
    pub fn id(&self) -> &str {
        &self.aggregate.id
    }

    /// Returns `true` once the workflow is ready for invocations.
    pub fn is_ready(&self) -> bool {
        self.status == WorkflowStatus::Ready
    }

    /// Look up a task spec by id.
    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.spec.as_ref().and_then(|spec| spec.tasks.get(id))
    }

    /// The task graph, empty until the spec arrives.
    pub fn tasks(&self) -> impl Iterator<Item = (&String, &TaskSpec)> {
        self.spec.iter().flat_map(|spec| spec.tasks.iter())
    }
}

impl Entity for WorkflowEntity {
    fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    fn apply_event(&mut self, event: &Event) -> Result<()> {
        match WorkflowEvent::from_event(event)? {
            WorkflowEvent::WorkflowCreated { spec } => {
                self.spec = Some(spec);
                self.created_at = event.created_at;
            }
            WorkflowEvent::WorkflowParsed {
                resolved,
                output_task,
            } => {
                // A ready graph is immutable; a deleted workflow stays deleted.
                if matches!(self.status, WorkflowStatus::Pending) {
                    self.status = WorkflowStatus::Ready;
                    self.resolved = resolved;
                    self.output_task = output_task;
                }
            }
            WorkflowEvent::WorkflowParsingFailed { error } => {
                if matches!(self.status, WorkflowStatus::Pending) {
                    self.status = WorkflowStatus::Failed;
                    self.error = Some(error);
                }
            }
            WorkflowEvent::WorkflowDeleted => {
                self.status = WorkflowStatus::Deleted;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_spec() -> WorkflowSpec {
        WorkflowSpec::new("linear")
            .with_task("a", TaskSpec::new("echo"))
            .with_task("b", TaskSpec::new("echo").requires("a"))
    }

    #[test]
    fn graph_validation_accepts_dag() {
        assert!(linear_spec().validate_graph().is_ok());
    }

    #[test]
    fn graph_validation_rejects_cycle() {
        let spec = WorkflowSpec::new("cyclic")
            .with_task("a", TaskSpec::new("echo").requires("b"))
            .with_task("b", TaskSpec::new("echo").requires("a"));
        let err = spec.validate_graph().unwrap_err();
        assert!(err.contains("cycle"));
    }

    #[test]
    fn graph_validation_rejects_unknown_dependency() {
        let spec = WorkflowSpec::new("dangling")
            .with_task("a", TaskSpec::new("echo").requires("ghost"));
        assert!(spec.validate_graph().is_err());
    }

    #[test]
    fn graph_validation_rejects_self_dependency() {
        let spec = WorkflowSpec::new("selfish").with_task("a", TaskSpec::new("echo").requires("a"));
        assert!(spec.validate_graph().is_err());
    }

    #[test]
    fn effective_output_task_prefers_explicit_then_unique_sink() {
        let mut spec = linear_spec();
        assert_eq!(spec.effective_output_task().as_deref(), Some("b"));

        spec.output_task = Some("a".to_owned());
        assert_eq!(spec.effective_output_task().as_deref(), Some("a"));

        let two_sinks = WorkflowSpec::new("fanless")
            .with_task("a", TaskSpec::new("echo"))
            .with_task("b", TaskSpec::new("echo"));
        assert_eq!(two_sinks.effective_output_task(), None);
    }

    #[test]
    fn entity_becomes_ready_after_parse() {
        let mut wf = WorkflowEntity::new("wf-1");
        wf.apply_event(
            &WorkflowEvent::WorkflowCreated { spec: linear_spec() }
                .into_event("wf-1")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(wf.status, WorkflowStatus::Pending);

        let resolved = BTreeMap::from([
            ("a".to_owned(), FnRef::new("native", "echo")),
            ("b".to_owned(), FnRef::new("native", "echo")),
        ]);
        wf.apply_event(
            &WorkflowEvent::WorkflowParsed {
                resolved,
                output_task: Some("b".to_owned()),
            }
            .into_event("wf-1")
            .unwrap(),
        )
        .unwrap();

        assert!(wf.is_ready());
        assert_eq!(wf.output_task.as_deref(), Some("b"));
        assert_eq!(wf.resolved["a"].runtime, "native");
    }

    #[test]
    fn parsing_failure_is_final() {
        let mut wf = WorkflowEntity::new("wf-1");
        wf.apply_event(
            &WorkflowEvent::WorkflowParsingFailed {
                error: "cycle".to_owned(),
            }
            .into_event("wf-1")
            .unwrap(),
        )
        .unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);

        // A later parse must not resurrect the workflow.
        wf.apply_event(
            &WorkflowEvent::WorkflowParsed {
                resolved: BTreeMap::new(),
                output_task: None,
            }
            .into_event("wf-1")
            .unwrap(),
        )
        .unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
    }

    #[test]
    fn unknown_event_type_is_unsupported() {
        let mut wf = WorkflowEntity::new("wf-1");
        let event = Event::new(Aggregate::workflow("wf-1"), "Martian", json!({}));
        let err = wf.apply_event(&event).unwrap_err();
        assert!(err.is_unsupported_event());
    }

    #[test]
    fn bad_payload_is_corrupted() {
        let mut wf = WorkflowEntity::new("wf-1");
        let event = Event::new(
            Aggregate::workflow("wf-1"),
            "WorkflowCreated",
            json!({"type": "WorkflowCreated", "spec": 42}),
        );
        let err = wf.apply_event(&event).unwrap_err();
        assert!(matches!(err, Error::CorruptedEventPayload { .. }));
    }
}
