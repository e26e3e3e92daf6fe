//! Capabilities the surrounding engine lends to the VM.
//!
//! The VM never reaches for engine globals. Everything it needs from the
//! host (broadcasting events and finding other entities) comes through
//! these traits, so tests can drive it with a fake host.

use crate::runtime::script::{ArgBag, RuntimeContext};

/// Engine-side entity identifier.
pub type EntityId = u32;

/// Global event broadcast.
pub trait EventSink {
    /// Called for every untargeted `FireEvent`.
    fn fire_event(&mut self, event: &str, args: &ArgBag);
}

/// Entity resolution for targeted `FireEvent`.
pub trait EntityLookup {
    /// Resolves an entity by name.
    fn resolve(&self, name: &str) -> Option<EntityId>;

    /// Lends the entity's script context to the VM for a nested Dispatch.
    ///
    /// Returns `None` when the entity has no script attached, or when its
    /// context is already lent out.
    fn take_context(&mut self, id: EntityId) -> Option<RuntimeContext>;

    /// Returns a context previously handed out by [`take_context`].
    ///
    /// [`take_context`]: EntityLookup::take_context
    fn return_context(&mut self, id: EntityId, context: RuntimeContext);

    /// Whether the entity exists and has a script context, lent out or not.
    fn has_script(&self, id: EntityId) -> bool;
}

/// Everything the VM calls out to.
pub trait HostBridge: EventSink + EntityLookup {}

impl<T: EventSink + EntityLookup> HostBridge for T {}

/// Host with no entities that drops every event.
#[derive(Debug, Default)]
pub struct NullHost;

impl EventSink for NullHost {
    fn fire_event(&mut self, _event: &str, _args: &ArgBag) {}
}

impl EntityLookup for NullHost {
    fn resolve(&self, _name: &str) -> Option<EntityId> {
        None
    }

    fn take_context(&mut self, _id: EntityId) -> Option<RuntimeContext> {
        None
    }

    fn return_context(&mut self, _id: EntityId, _context: RuntimeContext) {}

    fn has_script(&self, _id: EntityId) -> bool {
        false
    }
}
