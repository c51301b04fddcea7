//! Aggregates and events, the units of the event-sourced core.
//!
//! An [`Aggregate`] identifies one ordered event stream. An [`Event`] is an
//! immutable record appended to such a stream; the backend assigns each
//! event a contiguous `sequence` starting at 0 and events for one aggregate
//! are totally ordered by append time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{Error, Result};

/// Aggregate kind for workflow definitions.
pub const WORKFLOW_KIND: &str = "workflow";

/// Aggregate kind for workflow invocations.
pub const INVOCATION_KIND: &str = "invocation";

/// Identity of an ordered event stream: a kind plus an id unique within it.
///
/// The aggregate is the unit of strict ordering and of entity projection.
/// Encoded as `<kind>/<id>`.
///
/// # Example
///
/// ```
/// use weft::Aggregate;
///
/// let a = Aggregate::workflow("wf-1");
/// assert_eq!(a.to_string(), "workflow/wf-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Aggregate {
    /// The aggregate kind (e.g. `workflow`, `invocation`).
    pub kind: String,
    /// The id, unique within the kind.
    pub id: String,
}

impl Aggregate {
    /// Create an aggregate from a kind and id.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a workflow aggregate.
    pub fn workflow(id: impl Into<String>) -> Self {
        Self::new(WORKFLOW_KIND, id)
    }

    /// Create an invocation aggregate.
    pub fn invocation(id: impl Into<String>) -> Self {
        Self::new(INVOCATION_KIND, id)
    }

    /// Validate that both kind and id are non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(Error::invalid_aggregate("empty kind"));
        }
        if self.id.is_empty() {
            return Err(Error::invalid_aggregate("empty id"));
        }
        Ok(())
    }
}

impl std::fmt::Display for Aggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// An immutable record appended to an aggregate's stream.
///
/// The `parent` aggregate, when present, fans the event out to subscribers
/// of the parent's stream as well (used by sub-workflow invocations).
/// `metadata` is a free-form string map that carries the trace context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// The aggregate this event belongs to.
    pub aggregate: Aggregate,
    /// Optional parent aggregate for fan-out to a parent's subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Aggregate>,
    /// Domain verb, e.g. `TaskSucceeded`.
    pub event_type: String,
    /// JSON payload, decoded by the entity according to `event_type`.
    pub payload: Value,
    /// String map carrying the trace context and caller-defined labels.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// When the event was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Monotonic position within the aggregate, assigned by the backend.
    #[serde(default)]
    pub sequence: u64,
}

impl Event {
    /// Create an event for an aggregate, stamped with the current time.
    ///
    /// The `sequence` is left at 0; the backend assigns the real value on
    /// append.
    pub fn new(aggregate: Aggregate, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            aggregate,
            parent: None,
            event_type: event_type.into(),
            payload,
            metadata: BTreeMap::new(),
            created_at: OffsetDateTime::now_utc(),
            sequence: 0,
        }
    }

    /// Attach a parent aggregate for fan-out.
    pub fn with_parent(mut self, parent: Aggregate) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate the event for appending: a valid aggregate and a non-empty
    /// type.
    pub fn validate(&self) -> Result<()> {
        self.aggregate.validate()?;
        if let Some(parent) = &self.parent {
            parent.validate()?;
        }
        if self.event_type.is_empty() {
            return Err(Error::invalid_event("empty event type"));
        }
        Ok(())
    }

    /// Labels used for subscription matching.
    ///
    /// Includes `aggregate.kind`, `aggregate.id`, `event.type`, the parent
    /// aggregate when present, and every metadata entry.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.metadata.clone();
        labels.insert("aggregate.kind".to_owned(), self.aggregate.kind.clone());
        labels.insert("aggregate.id".to_owned(), self.aggregate.id.clone());
        labels.insert("event.type".to_owned(), self.event_type.clone());
        if let Some(parent) = &self.parent {
            labels.insert("parent.kind".to_owned(), parent.kind.clone());
            labels.insert("parent.id".to_owned(), parent.id.clone());
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_display() {
        let a = Aggregate::invocation("inv-7");
        assert_eq!(format!("{}", a), "invocation/inv-7");
    }

    #[test]
    fn aggregate_validation() {
        assert!(Aggregate::new("workflow", "wf-1").validate().is_ok());
        assert!(Aggregate::new("", "wf-1").validate().is_err());
        assert!(Aggregate::new("workflow", "").validate().is_err());
    }

    #[test]
    fn event_validation_rejects_empty_type() {
        let event = Event::new(Aggregate::workflow("wf-1"), "", Value::Null);
        let err = event.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidEvent { .. }));
    }

    #[test]
    fn labels_cover_aggregate_parent_and_metadata() {
        let event = Event::new(
            Aggregate::invocation("inv-1"),
            "TaskStarted",
            serde_json::json!({"task_id": "a"}),
        )
        .with_parent(Aggregate::invocation("inv-0"))
        .with_metadata("trace-id", "abc123");

        let labels = event.labels();
        assert_eq!(labels["aggregate.kind"], "invocation");
        assert_eq!(labels["aggregate.id"], "inv-1");
        assert_eq!(labels["event.type"], "TaskStarted");
        assert_eq!(labels["parent.id"], "inv-0");
        assert_eq!(labels["trace-id"], "abc123");
    }
}
