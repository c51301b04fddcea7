//! Event projection.

use tracing::trace;

use crate::entity::Entity;
use crate::error::Result;
use crate::event::Event;

/// Fold events onto an entity in order.
///
/// Aborts on the first per-event failure and reports it; the entity is then
/// in a partial state and must be discarded by the caller. Projecting an
/// empty slice is a no-op.
pub fn project<E: Entity>(target: &mut E, events: &[Event]) -> Result<()> {
    for event in events {
        trace!(
            aggregate = %event.aggregate,
            event_type = %event.event_type,
            sequence = event.sequence,
            "Projecting event"
        );
        target.apply_event(event)?;
    }
    Ok(())
}
