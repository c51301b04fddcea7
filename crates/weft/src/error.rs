//! Error types for weft.

use thiserror::Error;

use crate::event::Aggregate;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in weft operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An aggregate was malformed (empty kind or id).
    #[error("invalid aggregate: {reason}")]
    InvalidAggregate {
        /// What was wrong with the aggregate.
        reason: String,
    },

    /// An event was rejected by the backend before being appended.
    #[error("invalid event: {reason}")]
    InvalidEvent {
        /// What was wrong with the event.
        reason: String,
    },

    /// A cached entity had a different kind than the caller expected.
    ///
    /// This indicates a factory or caller bug, not bad data: the aggregate
    /// kind determines the entity variant at construction time.
    #[error("{aggregate}: expected a {expected} entity")]
    InvalidEntity {
        /// The aggregate whose entity had the wrong kind.
        aggregate: Aggregate,
        /// The entity kind the caller asked for.
        expected: &'static str,
    },

    /// The in-memory event store reached its capacity bound.
    #[error("{aggregate}: event store out of space")]
    EventStoreOverflow {
        /// The aggregate whose append was rejected.
        aggregate: Aggregate,
    },

    /// The entity cannot handle this event type.
    ///
    /// The projector reports this without mutating the entity; the cache
    /// skips the event but still notifies subscribers.
    #[error("{aggregate}: event {event_type} not supported")]
    UnsupportedEntityEvent {
        /// The aggregate the event was applied to.
        aggregate: Aggregate,
        /// The event type that could not be handled.
        event_type: String,
    },

    /// An event payload failed to decode during projection.
    #[error("{aggregate}: failed to parse payload of {event_type}: {source}")]
    CorruptedEventPayload {
        /// The aggregate the event belongs to.
        aggregate: Aggregate,
        /// The event type whose payload failed to decode.
        event_type: String,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// No events exist for the requested aggregate.
    #[error("{aggregate}: entity not found")]
    EntityNotFound {
        /// The aggregate that has no events.
        aggregate: Aggregate,
    },

    /// No resolver namespace produced a hit for a function name.
    #[error("function not found: {name}")]
    FunctionNotFound {
        /// The unresolved function name.
        name: String,
    },

    /// More than one resolver namespace produced a hit for a function name.
    #[error("function {name} is ambiguous across namespaces: {namespaces:?}")]
    FunctionAmbiguous {
        /// The ambiguous function name.
        name: String,
        /// The namespaces that each claimed the name.
        namespaces: Vec<String>,
    },

    /// A function reference names a runtime that is not registered.
    #[error("unknown function runtime: {name}")]
    UnknownRuntime {
        /// The runtime name carried by the function reference.
        name: String,
    },

    /// A task id does not exist in the invocation's task graph.
    #[error("invocation {invocation}: unknown task {task}")]
    UnknownTask {
        /// The invocation id.
        invocation: String,
        /// The task id that was not found.
        task: String,
    },

    /// An invocation was created against a workflow that is not ready.
    #[error("workflow {id} is not ready")]
    WorkflowNotReady {
        /// The workflow id.
        id: String,
    },

    /// Failed to serialize or deserialize event or value data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),
}

impl Error {
    /// Create an [`Error::InvalidAggregate`] with a reason.
    pub fn invalid_aggregate(reason: impl Into<String>) -> Self {
        Error::InvalidAggregate {
            reason: reason.into(),
        }
    }

    /// Create an [`Error::InvalidEvent`] with a reason.
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Error::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Create an [`Error::UnsupportedEntityEvent`] with context.
    pub fn unsupported_event(aggregate: &Aggregate, event_type: impl Into<String>) -> Self {
        Error::UnsupportedEntityEvent {
            aggregate: aggregate.clone(),
            event_type: event_type.into(),
        }
    }

    /// Create an [`Error::CorruptedEventPayload`] with context.
    pub fn corrupted_payload(
        aggregate: &Aggregate,
        event_type: impl Into<String>,
        source: serde_json::Error,
    ) -> Self {
        Error::CorruptedEventPayload {
            aggregate: aggregate.clone(),
            event_type: event_type.into(),
            source,
        }
    }

    /// Create an [`Error::EntityNotFound`] for an aggregate.
    pub fn not_found(aggregate: &Aggregate) -> Self {
        Error::EntityNotFound {
            aggregate: aggregate.clone(),
        }
    }

    /// Returns `true` if this error is an [`Error::UnsupportedEntityEvent`].
    pub fn is_unsupported_event(&self) -> bool {
        matches!(self, Error::UnsupportedEntityEvent { .. })
    }
}
