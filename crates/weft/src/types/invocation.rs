//! The workflow invocation entity.
//!
//! An invocation is one execution of a workflow: a per-task status map,
//! per-task outputs, dynamically added tasks, and an overall status driven
//! entirely by appended events. Terminal statuses are absorbing: once the
//! invocation succeeded, failed, or was aborted, later task events no
//! longer mutate state.

use std::collections::BTreeMap;

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::event::{Aggregate, Event};
use crate::types::workflow::TaskSpec;
use crate::value::ValueMap;

/// Overall status of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Created, no task has started yet.
    Scheduled,
    /// At least one task has started.
    InProgress,
    /// All tasks completed and the output was recorded.
    Succeeded,
    /// A task failure propagated to the invocation.
    Failed,
    /// Aborted on cancellation or deadline expiry.
    Aborted,
}

impl InvocationStatus {
    /// Terminal statuses are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvocationStatus::Succeeded | InvocationStatus::Failed | InvocationStatus::Aborted
        )
    }
}

/// Status of one task within an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet dispatched.
    Pending,
    /// Dispatched to a runtime.
    Started,
    /// Expanded into dynamic children; succeeds when they all succeed.
    Waiting,
    /// Completed with an output.
    Succeeded,
    /// Completed with an error.
    Failed,
}

impl TaskStatus {
    /// Succeeded or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// Recorded run state of one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRun {
    /// Current status.
    #[serde(default = "TaskRun::default_status")]
    pub status: TaskStatus,
    /// Output map, present after success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ValueMap>,
    /// Error message, present after failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the recorded failure was a transport-level one.
    #[serde(default)]
    pub retryable: bool,
}

impl TaskRun {
    fn default_status() -> TaskStatus {
        TaskStatus::Pending
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

/// A task added at runtime, keyed by id in the expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedTask {
    /// Task id, unique within the invocation.
    pub id: String,
    /// The task spec.
    pub spec: TaskSpec,
}

/// An extra dependency edge between expansion members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// The dependency.
    pub from: String,
    /// The dependent task.
    pub to: String,
}

/// A sub-graph returned by a runtime instead of a value.
///
/// The expansion must add at least one task; the originating task waits
/// until every added task succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicExpansion {
    /// The tasks to add.
    pub tasks: NonEmpty<NamedTask>,
    /// Extra edges between added tasks, merged into their dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Edge>,
}

/// A dynamically added task as recorded on the invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicTask {
    /// The task spec, with expansion edges merged into `requires`.
    pub spec: TaskSpec,
    /// The task whose expansion added this one.
    pub parent: String,
}

/// Events of the invocation aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InvocationEvent {
    /// The invocation was created against a ready workflow.
    InvocationCreated {
        /// The workflow definition id.
        workflow_id: String,
        /// Caller-provided inputs.
        #[serde(default)]
        inputs: ValueMap,
        /// Parent invocation for sub-workflows, stored by identity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<Aggregate>,
        /// Absolute deadline; expiry aborts the invocation.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[serde(with = "time::serde::rfc3339::option")]
        deadline: Option<OffsetDateTime>,
    },
    /// A task was dispatched to a runtime.
    TaskStarted {
        /// The task id.
        task_id: String,
    },
    /// A task completed with an output.
    TaskSucceeded {
        /// The task id.
        task_id: String,
        /// The output map.
        #[serde(default)]
        output: ValueMap,
    },
    /// A task completed with an error.
    TaskFailed {
        /// The task id.
        task_id: String,
        /// The error message.
        error: String,
        /// `true` for transport-level failures.
        #[serde(default)]
        retryable: bool,
    },
    /// A runtime expanded a task into a dynamic sub-graph.
    TasksAdded {
        /// The task whose invocation produced the expansion.
        parent_task: String,
        /// The added tasks and edges.
        expansion: DynamicExpansion,
    },
    /// The caller asked for cancellation; honored on the next reconciliation.
    InvocationCancelRequested,
    /// All tasks completed; the invocation output was recorded.
    InvocationCompleted {
        /// The output of the workflow's output task.
        #[serde(default)]
        output: ValueMap,
    },
    /// A task failure propagated to the invocation.
    InvocationFailed {
        /// The error message.
        error: String,
    },
    /// The invocation was aborted (cancellation or deadline).
    InvocationAborted {
        /// Why the invocation was aborted.
        reason: String,
    },
}

impl InvocationEvent {
    /// The event type string stored on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            InvocationEvent::InvocationCreated { .. } => "InvocationCreated",
            InvocationEvent::TaskStarted { .. } => "TaskStarted",
            InvocationEvent::TaskSucceeded { .. } => "TaskSucceeded",
            InvocationEvent::TaskFailed { .. } => "TaskFailed",
            InvocationEvent::TasksAdded { .. } => "TasksAdded",
            InvocationEvent::InvocationCancelRequested => "InvocationCancelRequested",
            InvocationEvent::InvocationCompleted { .. } => "InvocationCompleted",
            InvocationEvent::InvocationFailed { .. } => "InvocationFailed",
            InvocationEvent::InvocationAborted { .. } => "InvocationAborted",
        }
    }

    /// Wrap into an [`Event`] for the invocation aggregate `id`.
    pub fn into_event(self, id: &str) -> Result<Event> {
        let event_type = self.event_type();
        let payload = serde_json::to_value(&self)?;
        Ok(Event::new(Aggregate::invocation(id), event_type, payload))
    }

    fn is_known(event_type: &str) -> bool {
        matches!(
            event_type,
            "InvocationCreated"
                | "TaskStarted"
                | "TaskSucceeded"
                | "TaskFailed"
                | "TasksAdded"
                | "InvocationCancelRequested"
                | "InvocationCompleted"
                | "InvocationFailed"
                | "InvocationAborted"
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

/// The projected invocation entity.
#[derive(Debug, Clone)]
pub struct InvocationEntity {
    aggregate: Aggregate,
    /// Overall status.
    pub status: InvocationStatus,
    /// The workflow definition this invocation executes.
    pub workflow_id: String,
    /// Caller-provided inputs.
    pub inputs: ValueMap,
    /// Parent invocation identity for sub-workflows.
    pub parent: Option<Aggregate>,
    /// Absolute deadline, when set.
    pub deadline: Option<OffsetDateTime>,
    /// Set by `InvocationCancelRequested`; honored by the scheduler.
    pub cancel_requested: bool,
    /// Observed run state per task id.
    pub tasks: BTreeMap<String, TaskRun>,
    /// Dynamically added tasks keyed by task id.
    pub dynamic_tasks: BTreeMap<String, DynamicTask>,
    /// Final output, present when succeeded.
    pub output: Option<ValueMap>,
    /// Final error, present when failed or aborted.
    pub error: Option<String>,
    /// When the invocation was created.
    pub created_at: OffsetDateTime,
}

impl InvocationEntity {
    /// An empty scheduled entity for projection.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            aggregate: Aggregate::invocation(id),
            status: InvocationStatus::Scheduled,
            workflow_id: String::new(),
            inputs: ValueMap::new(),
            parent: None,
            deadline: None,
            cancel_requested: false,
            tasks: BTreeMap::new(),
            dynamic_tasks: BTreeMap::new(),
            output: None,
            error: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    /// The invocation id.
    pub fn id(&self) -> &str {
        &self.aggregate.id
    }

    /// Returns `true` once the status is absorbing.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The observed status of a task; pending when never touched.
    pub fn task_status(&self, task_id: &str) -> TaskStatus {
        self.tasks
            .get(task_id)
            .map(|run| run.status)
            .unwrap_or(TaskStatus::Pending)
    }

    /// The recorded output of a task, when it succeeded.
    pub fn task_output(&self, task_id: &str) -> Option<&ValueMap> {
        self.tasks.get(task_id).and_then(|run| run.output.as_ref())
    }

    /// Dynamic tasks added by the expansion of `parent`.
    pub fn children_of<'a>(
        &'a self,
        parent: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a DynamicTask)> {
        self.dynamic_tasks
            .iter()
            .filter(move |(_, task)| task.parent == parent)
    }

    fn task_entry(&mut self, task_id: &str) -> &mut TaskRun {
        self.tasks.entry(task_id.to_owned()).or_default()
    }
}

impl Entity for InvocationEntity {
    fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    fn apply_event(&mut self, event: &Event) -> Result<()> {
        let decoded = InvocationEvent::from_event(event)?;

        // Terminal statuses are absorbing: late task completions and cancel
        // requests are ignored without error.
        if self.is_terminal() {
            return Ok(());
        }

        match decoded {
            InvocationEvent::InvocationCreated {
                workflow_id,
                inputs,
                parent,
                deadline,
            } => {
                self.workflow_id = workflow_id;
                self.inputs = inputs;
                self.parent = parent;
                self.deadline = deadline;
                self.created_at = event.created_at;
            }
            InvocationEvent::TaskStarted { task_id } => {
                let run = self.task_entry(&task_id);
                if run.status == TaskStatus::Pending {
                    run.status = TaskStatus::Started;
                }
                self.status = InvocationStatus::InProgress;
            }
            InvocationEvent::TaskSucceeded { task_id, output } => {
                let run = self.task_entry(&task_id);
                run.status = TaskStatus::Succeeded;
                run.output = Some(output);
                run.error = None;
            }
            InvocationEvent::TaskFailed {
                task_id,
                error,
                retryable,
            } => {
                let run = self.task_entry(&task_id);
                run.status = TaskStatus::Failed;
                run.error = Some(error);
                run.retryable = retryable;
            }
            InvocationEvent::TasksAdded {
                parent_task,
                expansion,
            } => {
                for named in expansion.tasks {
                    let mut spec = named.spec;
                    for edge in &expansion.edges {
                        if edge.to == named.id && !spec.requires.contains(&edge.from) {
                            spec.requires.push(edge.from.clone());
                        }
                    }
                    self.dynamic_tasks.insert(
                        named.id.clone(),
                        DynamicTask {
                            spec,
                            parent: parent_task.clone(),
                        },
                    );
                    self.task_entry(&named.id);
                }
                self.task_entry(&parent_task).status = TaskStatus::Waiting;
            }
            InvocationEvent::InvocationCancelRequested => {
                self.cancel_requested = true;
            }
            InvocationEvent::InvocationCompleted { output } => {
                self.status = InvocationStatus::Succeeded;
                self.output = Some(output);
            }
            InvocationEvent::InvocationFailed { error } => {
                self.status = InvocationStatus::Failed;
                self.error = Some(error);
            }
            InvocationEvent::InvocationAborted { reason } => {
                self.status = InvocationStatus::Aborted;
                self.error = Some(reason);
            }
        }
        Ok(())
    }
}
