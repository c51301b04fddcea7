//! The invocation reconciliation loop.
//!
//! Per invocation the controller keeps a slot: a busy flag, a dirty flag,
//! and the in-flight set of dispatched task ids. At most one reconciliation
//! runs per invocation; concurrent triggers coalesce into exactly one
//! re-evaluation through the dirty flag. The in-flight set provides
//! at-most-once dispatch per logical task slot and is purged by observing
//! task lifecycle events in the projected state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tokio::sync::{watch, Semaphore};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::ControllerConfig;
use crate::api::{InvocationApi, TaskApi};
use crate::error::{Error, Result};
use crate::event::INVOCATION_KIND;
use crate::pubsub::Delivery;
use crate::scheduler::{AbortReason, RunTaskAction, Scheduler};
use crate::store::{Backend, Invocations, Workflows};
use crate::types::invocation::{InvocationEntity, TaskStatus};
use crate::types::workflow::{WorkflowEntity, WorkflowStatus};
use crate::value::ValueMap;

#[derive(Default)]
struct Slot {
    busy: bool,
    dirty: bool,
    inflight: HashSet<String>,
    /// Waiting parents already completed by this controller; guards against
    /// re-appending while the cache catches up.
    settled_parents: HashSet<String>,
    /// A terminal event was appended; suppress further terminal appends
    /// until the projection reflects it.
    finishing: bool,
}

enum Reconciled {
    /// Work may remain; re-evaluate on the next trigger.
    Progressed,
    /// The invocation reached a terminal status; the slot was released.
    Terminal,
}

/// Drives invocations to completion by reconciling projected state.
pub struct InvocationController {
    backend: Arc<dyn Backend>,
    invocations: Invocations,
    workflows: Workflows,
    scheduler: Scheduler,
    tasks: TaskApi,
    api: InvocationApi,
    slots: Mutex<HashMap<String, Slot>>,
    pool: Semaphore,
    /// Opened at construction so no notification between construction and
    /// worker startup is missed.
    notifications: Mutex<Option<crate::pubsub::Subscription<crate::cache::Notification>>>,
    config: ControllerConfig,
}

impl InvocationController {
    /// Create a controller over the typed stores and APIs. The backend is
    /// used to resynchronize after restarts and subscription overflow.
    pub fn new(
        backend: Arc<dyn Backend>,
        invocations: Invocations,
        workflows: Workflows,
        scheduler: Scheduler,
        tasks: TaskApi,
        api: InvocationApi,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let notifications = invocations.subscribe();
        Arc::new(Self {
            backend,
            invocations,
            workflows,
            scheduler,
            tasks,
            api,
            slots: Mutex::new(HashMap::new()),
            pool: Semaphore::new(config.workers.max(1)),
            notifications: Mutex::new(Some(notifications)),
            config,
        })
    }

    /// Run the controller until the shutdown signal.
    ///
    /// Triggers: invocation notifications from the cache, the periodic
    /// tick (deadlines, missed notifications), and explicit pokes.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut notifications = self
            .notifications
            .lock()
            .expect("subscription lock poisoned")
            .take()
            .unwrap_or_else(|| self.invocations.subscribe());
        let mut tick = interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(workers = self.config.workers, "Invocation controller started");

        // Resume invocations that predate this controller instance.
        Self::resync(&self).await;

        loop {
            tokio::select! {
                delivery = notifications.recv() => {
                    match delivery {
                        Some(Delivery::Message(notification)) => {
                            let id = notification.aggregate().id.clone();
                            Arc::clone(&self).poke(&id);
                        }
                        Some(Delivery::Lagged(n)) => {
                            warn!(dropped = n, "Controller notifications lagged; re-triggering all");
                            Self::resync(&self).await;
                        }
                        None => {
                            warn!("Notification stream closed; controller stopping");
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    for id in self.invocations.list() {
                        Arc::clone(&self).poke(&id);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Invocation controller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Re-trigger every invocation known to the backend. Used at startup
    /// and after subscription overflow; cache read-through re-projects.
    async fn resync(this: &Arc<Self>) {
        match this.backend.list(&|kind| kind == INVOCATION_KIND).await {
            Ok(aggregates) => {
                for aggregate in aggregates {
                    Arc::clone(this).poke(&aggregate.id);
                }
            }
            Err(err) => {
                error!(error = %err, "Failed to list invocations for resync");
            }
        }
    }

    /// Trigger a reconciliation for an invocation id.
    ///
    /// While one is in progress, additional pokes set the dirty flag and
    /// coalesce into exactly one re-evaluation after it completes.
    pub fn poke(self: Arc<Self>, id: &str) {
        let should_spawn = {
            let mut slots = self.slots.lock().expect("slot lock poisoned");
            let slot = slots.entry(id.to_owned()).or_default();
            if slot.busy {
                slot.dirty = true;
                false
            } else {
                slot.busy = true;
                true
            }
        };
        if should_spawn {
            let id = id.to_owned();
            tokio::spawn(async move { self.reconcile_loop(id).await });
        }
    }

    async fn reconcile_loop(self: Arc<Self>, id: String) {
        let mut failures: u32 = 0;
        loop {
            let permit = self.pool.acquire().await.expect("pool semaphore closed");
            let outcome = tokio::time::timeout(
                self.config.reconcile_deadline,
                Self::reconcile_once(&self, &id),
            )
            .await;
            drop(permit);

            match outcome {
                Ok(Ok(Reconciled::Terminal)) => {
                    self.remove_slot(&id);
                    return;
                }
                Ok(Ok(Reconciled::Progressed)) => {
                    failures = 0;
                    if !self.take_dirty(&id) {
                        return;
                    }
                }
                Ok(Err(err)) => {
                    failures = failures.saturating_add(1);
                    // A stream that still has no events after several reads
                    // is a bogus trigger, not a transient failure.
                    if failures >= 5 && matches!(err, Error::EntityNotFound { .. }) {
                        error!(invocation_id = %id, "No events for invocation; dropping slot");
                        self.remove_slot(&id);
                        return;
                    }
                    let backoff = self.config.backoff(failures);
                    warn!(
                        invocation_id = %id,
                        error = %err,
                        failures,
                        backoff_ms = backoff.as_millis(),
                        "Reconciliation failed; backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(_) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        invocation_id = %id,
                        deadline_ms = self.config.reconcile_deadline.as_millis(),
                        "Reconciliation deadline exceeded; re-queueing"
                    );
                }
            }
        }
    }

    /// One reconciliation: project, guard, evaluate, dispatch.
    async fn reconcile_once(this: &Arc<Self>, id: &str) -> Result<Reconciled> {
        let invocation = this.invocations.get_by_id(id).await?;
        if invocation.is_terminal() {
            return Ok(Reconciled::Terminal);
        }

        let workflow = this.workflows.get_by_id(&invocation.workflow_id).await?;
        match workflow.status {
            WorkflowStatus::Ready => {}
            WorkflowStatus::Failed | WorkflowStatus::Deleted => {
                if this.begin_finishing(id) {
                    let result = this
                        .api
                        .fail(
                            &invocation,
                            format!("workflow {} is not runnable", invocation.workflow_id),
                        )
                        .await;
                    if let Err(err) = result {
                        this.clear_finishing(id);
                        return Err(err);
                    }
                }
                return Ok(Reconciled::Progressed);
            }
            WorkflowStatus::Pending => {
                return Err(Error::WorkflowNotReady {
                    id: invocation.workflow_id.clone(),
                });
            }
        }

        this.purge_inflight(id, &invocation);

        let now = OffsetDateTime::now_utc();
        let schedule = this.scheduler.evaluate(now, &invocation, &workflow);

        if let Some(reason) = &schedule.abort {
            if this.begin_finishing(id) {
                debug!(invocation_id = %id, reason = %reason, "Aborting invocation");
                let result = match reason {
                    AbortReason::TaskFailed { .. } => {
                        this.api.fail(&invocation, reason.to_string()).await
                    }
                    AbortReason::DeadlineExceeded | AbortReason::CancelRequested => {
                        this.api.abort(&invocation, reason.to_string()).await
                    }
                };
                if let Err(err) = result {
                    this.clear_finishing(id);
                    return Err(err);
                }
            }
            return Ok(Reconciled::Progressed);
        }

        if this.settle_waiting_parents(id, &invocation).await? > 0 {
            // Parent completions will re-trigger via their notifications.
            return Ok(Reconciled::Progressed);
        }

        if schedule.run_tasks.is_empty() && all_tasks_settled(&invocation, &workflow) {
            if this.begin_finishing(id) {
                if let Err(err) = this.finish(&invocation, &workflow).await {
                    this.clear_finishing(id);
                    return Err(err);
                }
            }
            return Ok(Reconciled::Progressed);
        }

        let reserved = this.reserve(id, &schedule.run_tasks);
        for task_id in reserved {
            let controller = Arc::clone(this);
            let invocation = invocation.clone();
            let workflow = workflow.clone();
            tokio::spawn(async move {
                let id = invocation.id().to_owned();
                if let Err(err) = controller.tasks.run(&invocation, &workflow, &task_id).await {
                    error!(
                        invocation_id = %id,
                        task_id = %task_id,
                        error = %err,
                        "Task dispatch failed; releasing slot"
                    );
                    controller.unreserve(&id, &task_id);
                    controller.poke(&id);
                }
            });
        }

        for action in &schedule.prepare_tasks {
            let tasks = this.tasks.clone();
            let workflow = workflow.clone();
            let task_id = action.task_id.clone();
            let expected_at = action.expected_at;
            tokio::spawn(async move {
                tasks.prepare(&workflow, &task_id, expected_at).await;
            });
        }

        Ok(Reconciled::Progressed)
    }

    /// Settle waiting parents whose children have all reached a terminal
    /// status: succeeded when every non-optional child succeeded, failed
    /// otherwise. A parent is never left waiting once its expansion is
    /// terminal.
    ///
    /// On success the parent's output is the output of the expansion's
    /// sink (the lexicographically greatest child no other child depends
    /// on).
    async fn settle_waiting_parents(
        &self,
        id: &str,
        invocation: &InvocationEntity,
    ) -> Result<usize> {
        let mut settled = 0usize;
        for (task_id, run) in &invocation.tasks {
            if run.status != TaskStatus::Waiting || self.parent_settled(id, task_id) {
                continue;
            }
            let children: Vec<&String> = invocation
                .children_of(task_id)
                .map(|(child_id, _)| child_id)
                .collect();
            if children.is_empty()
                || !children
                    .iter()
                    .all(|child| invocation.task_status(child).is_terminal())
            {
                continue;
            }

            let failed_child = children.iter().find(|child| {
                invocation.task_status(child) == TaskStatus::Failed
                    && !invocation
                        .dynamic_tasks
                        .get(child.as_str())
                        .is_some_and(|task| task.spec.optional)
            });
            if let Some(child) = failed_child {
                let error = invocation
                    .tasks
                    .get(child.as_str())
                    .and_then(|run| run.error.clone())
                    .unwrap_or_else(|| "task failed".to_owned());
                debug!(
                    invocation_id = %invocation.id(),
                    task_id = %task_id,
                    child = %child,
                    "Dynamic child failed; failing parent"
                );
                self.api
                    .fail_task(invocation, task_id, format!("task {child} failed: {error}"))
                    .await?;
                self.mark_parent_settled(id, task_id);
                settled += 1;
                continue;
            }

            let required: HashSet<&str> = children
                .iter()
                .filter_map(|child| invocation.dynamic_tasks.get(child.as_str()))
                .flat_map(|task| task.spec.requires.iter().map(String::as_str))
                .collect();
            let sink = children
                .iter()
                .filter(|child| !required.contains(child.as_str()))
                .max()
                .copied()
                .or_else(|| children.iter().max().copied());
            let output = sink
                .and_then(|sink| invocation.task_output(sink))
                .cloned()
                .unwrap_or_default();

            debug!(
                invocation_id = %invocation.id(),
                task_id = %task_id,
                "Dynamic children settled; completing parent"
            );
            self.api.complete_task(invocation, task_id, output).await?;
            self.mark_parent_settled(id, task_id);
            settled += 1;
        }
        Ok(settled)
    }

    /// Terminal bookkeeping once every task settled: fail if a non-optional
    /// task failed, otherwise complete with the output task's output.
    async fn finish(&self, invocation: &InvocationEntity, workflow: &WorkflowEntity) -> Result<()> {
        let failed = invocation.tasks.iter().find(|(id, run)| {
            run.status == TaskStatus::Failed && !is_optional(invocation, workflow, id)
        });
        if let Some((task_id, run)) = failed {
            let error = run
                .error
                .clone()
                .unwrap_or_else(|| format!("task {task_id} failed"));
            self.api
                .fail(invocation, format!("task {task_id} failed: {error}"))
                .await?;
            return Ok(());
        }

        let output: ValueMap = workflow
            .output_task
            .as_deref()
            .and_then(|task| invocation.task_output(task))
            .cloned()
            .unwrap_or_default();
        self.api.complete(invocation, output).await?;
        Ok(())
    }

    fn reserve(&self, id: &str, actions: &[RunTaskAction]) -> Vec<String> {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        let slot = slots.entry(id.to_owned()).or_default();
        let mut reserved = Vec::new();
        for action in actions {
            if slot.inflight.insert(action.task_id.clone()) {
                reserved.push(action.task_id.clone());
            } else {
                debug!(
                    invocation_id = %id,
                    task_id = %action.task_id,
                    "Dropping duplicate dispatch"
                );
            }
        }
        reserved
    }

    fn unreserve(&self, id: &str, task_id: &str) {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        if let Some(slot) = slots.get_mut(id) {
            slot.inflight.remove(task_id);
        }
    }

    /// Drop in-flight reservations the event log has caught up with.
    fn purge_inflight(&self, id: &str, invocation: &InvocationEntity) {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        if let Some(slot) = slots.get_mut(id) {
            slot.inflight
                .retain(|task| invocation.task_status(task) == TaskStatus::Pending);
        }
    }

    /// Check-and-set the finishing guard; only one terminal append may be
    /// issued until the projection reflects it.
    fn begin_finishing(&self, id: &str) -> bool {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        let slot = slots.entry(id.to_owned()).or_default();
        if slot.finishing {
            false
        } else {
            slot.finishing = true;
            true
        }
    }

    fn clear_finishing(&self, id: &str) {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        if let Some(slot) = slots.get_mut(id) {
            slot.finishing = false;
        }
    }

    fn parent_settled(&self, id: &str, task_id: &str) -> bool {
        let slots = self.slots.lock().expect("slot lock poisoned");
        slots
            .get(id)
            .is_some_and(|slot| slot.settled_parents.contains(task_id))
    }

    fn mark_parent_settled(&self, id: &str, task_id: &str) {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        slots
            .entry(id.to_owned())
            .or_default()
            .settled_parents
            .insert(task_id.to_owned());
    }

    fn take_dirty(&self, id: &str) -> bool {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        let Some(slot) = slots.get_mut(id) else {
            return false;
        };
        if slot.dirty {
            slot.dirty = false;
            true
        } else {
            slot.busy = false;
            false
        }
    }

    fn remove_slot(&self, id: &str) {
        self.slots.lock().expect("slot lock poisoned").remove(id);
    }
}

fn is_optional(invocation: &InvocationEntity, workflow: &WorkflowEntity, task_id: &str) -> bool {
    if let Some(dynamic) = invocation.dynamic_tasks.get(task_id) {
        return dynamic.spec.optional;
    }
    workflow.task(task_id).is_some_and(|spec| spec.optional)
}

/// Every task in the merged graph reached a terminal status.
fn all_tasks_settled(invocation: &InvocationEntity, workflow: &WorkflowEntity) -> bool {
    let static_settled = workflow
        .tasks()
        .all(|(id, _)| invocation.task_status(id).is_terminal());
    let dynamic_settled = invocation
        .dynamic_tasks
        .keys()
        .all(|id| invocation.task_status(id).is_terminal());
    static_settled && dynamic_settled
}
