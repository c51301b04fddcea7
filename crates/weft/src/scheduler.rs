//! The workflow scheduler.
//!
//! [`Scheduler::evaluate`] is a pure function from the projected invocation
//! state (plus its workflow definition and the current time) to a
//! [`Schedule`]. No I/O, no mutation of its inputs; calling it twice on the
//! same inputs yields identical schedules. Suppressing duplicate dispatches
//! is the controller's job, not the scheduler's.

use std::collections::BTreeMap;
use std::time::Duration;

use time::OffsetDateTime;

use crate::types::invocation::{InvocationEntity, TaskStatus};
use crate::types::workflow::{TaskSpec, WorkflowEntity};

/// Why the scheduler decided to abort an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A non-optional dependency of a still-pending task failed.
    TaskFailed {
        /// The failed task.
        task_id: String,
        /// The recorded task error.
        error: String,
    },
    /// The invocation's deadline expired.
    DeadlineExceeded,
    /// The caller requested cancellation.
    CancelRequested,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::TaskFailed { task_id, error } => {
                write!(f, "task {task_id} failed: {error}")
            }
            AbortReason::DeadlineExceeded => f.write_str("deadline exceeded"),
            AbortReason::CancelRequested => f.write_str("cancel requested"),
        }
    }
}

/// Dispatch one task now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTaskAction {
    /// The task to run.
    pub task_id: String,
}

/// Pre-warm one task expected to start soon. Best-effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareTaskAction {
    /// The task to pre-warm.
    pub task_id: String,
    /// Estimated start time.
    pub expected_at: OffsetDateTime,
}

/// The scheduler's decision for one reconciliation. Consumed immediately,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// The invocation this schedule is for.
    pub invocation_id: String,
    /// When the schedule was computed.
    pub created_at: OffsetDateTime,
    /// Abort the invocation instead of running tasks.
    pub abort: Option<AbortReason>,
    /// Tasks to dispatch, sorted lexicographically by task id.
    pub run_tasks: Vec<RunTaskAction>,
    /// Tasks to pre-warm.
    pub prepare_tasks: Vec<PrepareTaskAction>,
}

impl Schedule {
    fn new(invocation_id: &str, created_at: OffsetDateTime) -> Self {
        Self {
            invocation_id: invocation_id.to_owned(),
            created_at,
            abort: None,
            run_tasks: Vec::new(),
            prepare_tasks: Vec::new(),
        }
    }

    fn aborted(invocation_id: &str, created_at: OffsetDateTime, reason: AbortReason) -> Self {
        let mut schedule = Self::new(invocation_id, created_at);
        schedule.abort = Some(reason);
        schedule
    }

    /// No actions and no abort.
    pub fn is_empty(&self) -> bool {
        self.abort.is_none() && self.run_tasks.is_empty() && self.prepare_tasks.is_empty()
    }
}

/// One task in the merged static + dynamic graph.
struct TaskView<'a> {
    spec: &'a TaskSpec,
    status: TaskStatus,
    /// Dynamic tasks have no pre-resolved function ref.
    dynamic: bool,
}

/// Merge the workflow's task graph with the invocation's dynamic tasks.
fn task_views<'a>(
    invocation: &'a InvocationEntity,
    workflow: &'a WorkflowEntity,
) -> BTreeMap<&'a str, TaskView<'a>> {
    let mut views: BTreeMap<&str, TaskView<'_>> = workflow
        .tasks()
        .map(|(id, spec)| {
            (
                id.as_str(),
                TaskView {
                    spec,
                    status: invocation.task_status(id),
                    dynamic: false,
                },
            )
        })
        .collect();
    for (id, dynamic) in &invocation.dynamic_tasks {
        views.insert(
            id.as_str(),
            TaskView {
                spec: &dynamic.spec,
                status: invocation.task_status(id),
                dynamic: true,
            },
        );
    }
    views
}

/// A dependency counts as satisfied once it succeeded, or once it failed
/// while marked optional (its output resolves to nil).
fn dependency_satisfied(view: &TaskView<'_>) -> bool {
    match view.status {
        TaskStatus::Succeeded => true,
        TaskStatus::Failed => view.spec.optional,
        _ => false,
    }
}

/// The pure scheduling policy.
#[derive(Debug, Clone)]
pub struct Scheduler {
    /// How far ahead of the estimated start prepare actions are emitted.
    prepare_horizon: Duration,
}

impl Scheduler {
    /// A scheduler with the given prepare horizon.
    pub fn new(prepare_horizon: Duration) -> Self {
        Self { prepare_horizon }
    }

    /// Decide what to do for an invocation.
    ///
    /// Deterministic: run actions are emitted in lexicographic task-id
    /// order so replays produce identical schedules.
    pub fn evaluate(
        &self,
        now: OffsetDateTime,
        invocation: &InvocationEntity,
        workflow: &WorkflowEntity,
    ) -> Schedule {
        let id = invocation.id();
        if invocation.is_terminal() {
            return Schedule::new(id, now);
        }
        if invocation.cancel_requested {
            return Schedule::aborted(id, now, AbortReason::CancelRequested);
        }
        if invocation.deadline.is_some_and(|deadline| now >= deadline) {
            return Schedule::aborted(id, now, AbortReason::DeadlineExceeded);
        }

        let views = task_views(invocation, workflow);
        let mut schedule = Schedule::new(id, now);

        for (task_id, view) in &views {
            if view.status != TaskStatus::Pending {
                continue;
            }

            let mut satisfied = true;
            let mut upstream_running = !view.spec.requires.is_empty();
            for dep in &view.spec.requires {
                let Some(dep_view) = views.get(dep.as_str()) else {
                    // Dangling reference in a dynamic spec; the task can
                    // never become eligible, which surfaces on completion.
                    satisfied = false;
                    upstream_running = false;
                    continue;
                };
                if dep_view.status == TaskStatus::Failed && !dep_view.spec.optional {
                    let error = invocation
                        .tasks
                        .get(dep.as_str())
                        .and_then(|run| run.error.clone())
                        .unwrap_or_else(|| "task failed".to_owned());
                    return Schedule::aborted(
                        id,
                        now,
                        AbortReason::TaskFailed {
                            task_id: dep.clone(),
                            error,
                        },
                    );
                }
                if !dependency_satisfied(dep_view) {
                    satisfied = false;
                }
                if dep_view.status == TaskStatus::Pending {
                    upstream_running = false;
                }
            }

            if satisfied {
                schedule.run_tasks.push(RunTaskAction {
                    task_id: (*task_id).to_owned(),
                });
            } else if upstream_running && !view.dynamic {
                let prewarm = workflow
                    .resolved
                    .get(*task_id)
                    .is_some_and(|fn_ref| fn_ref.supports_prepare);
                if prewarm {
                    schedule.prepare_tasks.push(PrepareTaskAction {
                        task_id: (*task_id).to_owned(),
                        expected_at: now + self.prepare_horizon,
                    });
                }
            }
        }

        schedule
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
