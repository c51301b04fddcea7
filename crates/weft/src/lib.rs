//! Event-sourced engine for function-composition workflows.
//!
//! A caller submits a DAG of tasks (each a call into an external function
//! runtime) and weft drives the graph to completion: resolving data
//! dependencies, dispatching tasks, collecting outputs, and surfacing final
//! state. Every workflow invocation is a long-lived, event-sourced object
//! advanced by a reconciliation loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        InvocationController                          │
//! │                                                                      │
//! │   1. Notification / tick / poke for invocation I                     │
//! │   2. Project I and its workflow from the cache (snapshots)           │
//! │   3. scheduler.evaluate(now, invocation, workflow) → Schedule        │
//! │   4. Reserve run actions against the in-flight set                   │
//! │   5. Dispatch each reserved task through the TaskApi                 │
//! │   6. TaskApi appends TaskStarted / TaskSucceeded / TaskFailed        │
//! │   7. Backend publishes; cache projects and notifies; goto 1          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Event backend** ([`store::Backend`]) — append-only log, linearizable
//!   per aggregate, with label-matched pub/sub
//! - **Entity cache** ([`cache::EntityCache`]) — hot projections plus
//!   change notifications
//! - **Scheduler** ([`scheduler::Scheduler`]) — a pure, deterministic
//!   decision function
//! - **Controller** ([`controller::InvocationController`]) — at-most-once
//!   task dispatch per logical slot under concurrent triggers
//!
//! # Feature Flags
//!
//! - `postgres` — Enables [`store::PgBackend`], a durable append-only
//!   event log on PostgreSQL
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

pub mod api;
pub mod cache;
mod config;
pub mod controller;
mod engine;
mod entity;
mod error;
mod event;
mod projector;
pub mod pubsub;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod types;
mod value;

pub use cache::Notification;
pub use config::{BackendConfig, Config};
pub use engine::Engine;
pub use entity::{Entity, ProjectedEntity};
pub use error::{Error, Result};
pub use event::{Aggregate, Event, INVOCATION_KIND, WORKFLOW_KIND};
pub use nonempty::NonEmpty;
pub use projector::project;
pub use pubsub::{Delivery, Selector, Subscription};
pub use runtime::{FnRef, FunctionResolver, FunctionRuntime, Invoked, Registry, RuntimeError};
pub use scheduler::{AbortReason, Schedule, Scheduler};
pub use types::invocation::{
    DynamicExpansion, Edge, InvocationEntity, InvocationEvent, InvocationStatus, NamedTask,
    TaskStatus,
};
pub use types::workflow::{TaskSpec, WorkflowEntity, WorkflowEvent, WorkflowSpec, WorkflowStatus};
pub use value::{resolve_inputs, InputSpec, TypedValue, ValueMap};
