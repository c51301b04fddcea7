//! Domain APIs: the only writers to the event backend.
//!
//! Each API validates its inputs, constructs an event, and appends it. The
//! typed stores read; these modules write; nothing else touches the log.

mod invocation;
mod task;
mod workflow;

pub use invocation::InvocationApi;
pub use task::TaskApi;
pub use workflow::WorkflowApi;
