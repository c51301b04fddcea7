//! Entities: in-memory projections of aggregate event streams.
//!
//! The two entity kinds are modelled as tagged variants of
//! [`ProjectedEntity`] rather than trait objects; `apply_event` dispatch is
//! a match on (variant, event type) and unrecognized pairs fail with
//! `UnsupportedEntityEvent`. Snapshots for readers are plain clones.

use crate::error::{Error, Result};
use crate::event::{Aggregate, Event, INVOCATION_KIND, WORKFLOW_KIND};
use crate::types::invocation::InvocationEntity;
use crate::types::workflow::WorkflowEntity;

/// State that can be advanced by applying events.
pub trait Entity {
    /// The identity of the underlying event stream.
    fn aggregate(&self) -> &Aggregate;

    /// Advance state by one event, or fail with `UnsupportedEntityEvent` /
    /// `CorruptedEventPayload` leaving the entity untouched.
    fn apply_event(&mut self, event: &Event) -> Result<()>;
}

/// The entity sum held by the cache, keyed by aggregate kind.
#[derive(Debug, Clone)]
pub enum ProjectedEntity {
    /// A workflow definition.
    Workflow(WorkflowEntity),
    /// A workflow invocation.
    Invocation(InvocationEntity),
}

impl ProjectedEntity {
    /// The factory used by the cache: construct an empty entity for an
    /// aggregate, failing with `InvalidAggregate` for unknown kinds.
    pub fn from_aggregate(aggregate: &Aggregate) -> Result<Self> {
        aggregate.validate()?;
        match aggregate.kind.as_str() {
            WORKFLOW_KIND => Ok(ProjectedEntity::Workflow(WorkflowEntity::new(
                aggregate.id.clone(),
            ))),
            INVOCATION_KIND => Ok(ProjectedEntity::Invocation(InvocationEntity::new(
                aggregate.id.clone(),
            ))),
            other => Err(Error::invalid_aggregate(format!(
                "no entity registered for kind {other}"
            ))),
        }
    }

    /// Unwrap as a workflow, or fail with `InvalidEntity`.
    pub fn into_workflow(self) -> Result<WorkflowEntity> {
        match self {
            ProjectedEntity::Workflow(workflow) => Ok(workflow),
            ProjectedEntity::Invocation(invocation) => Err(Error::InvalidEntity {
                aggregate: invocation.aggregate().clone(),
                expected: WORKFLOW_KIND,
            }),
        }
    }

    /// Unwrap as an invocation, or fail with `InvalidEntity`.
    pub fn into_invocation(self) -> Result<InvocationEntity> {
        match self {
            ProjectedEntity::Invocation(invocation) => Ok(invocation),
            ProjectedEntity::Workflow(workflow) => Err(Error::InvalidEntity {
                aggregate: workflow.aggregate().clone(),
                expected: INVOCATION_KIND,
            }),
        }
    }
}

impl Entity for ProjectedEntity {
    fn aggregate(&self) -> &Aggregate {
        match self {
            ProjectedEntity::Workflow(workflow) => workflow.aggregate(),
            ProjectedEntity::Invocation(invocation) => invocation.aggregate(),
        }
    }

    fn apply_event(&mut self, event: &Event) -> Result<()> {
        match self {
            ProjectedEntity::Workflow(workflow) => workflow.apply_event(event),
            ProjectedEntity::Invocation(invocation) => invocation.apply_event(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_builds_entity_matching_aggregate_kind() {
        let workflow = ProjectedEntity::from_aggregate(&Aggregate::workflow("wf-1")).unwrap();
        assert!(matches!(workflow, ProjectedEntity::Workflow(_)));

        let invocation = ProjectedEntity::from_aggregate(&Aggregate::invocation("inv-1")).unwrap();
        assert!(matches!(invocation, ProjectedEntity::Invocation(_)));
    }

    #[test]
    fn factory_rejects_unknown_kind() {
        let err = ProjectedEntity::from_aggregate(&Aggregate::new("widget", "w-1")).unwrap_err();
        assert!(matches!(err, Error::InvalidAggregate { .. }));
    }

    #[test]
    fn typed_unwrap_enforces_kind() {
        let entity = ProjectedEntity::from_aggregate(&Aggregate::workflow("wf-1")).unwrap();
        let err = entity.into_invocation().unwrap_err();
        assert!(matches!(err, Error::InvalidEntity { .. }));
    }
}
