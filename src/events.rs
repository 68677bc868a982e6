// ============================================================================
// Event dispatcher
// ============================================================================
//
// Routes the eight lifecycle events to listeners in registration order.
// Listeners can mutate the entity they're handed (the flush orchestrator
// re-reads state after dispatch) and can fail the flush by returning an
// error.

use crate::change_detector::ChangeSet;
use crate::entity::{Entity, EntityHandle};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    PreFlush,
    PrePersist,
    PostPersist,
    PreUpdate,
    PostUpdate,
    PreRemove,
    PostRemove,
    PostFlush,
}

impl LifecycleEvent {
    fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::PreFlush => "preFlush",
            LifecycleEvent::PrePersist => "prePersist",
            LifecycleEvent::PostPersist => "postPersist",
            LifecycleEvent::PreUpdate => "preUpdate",
            LifecycleEvent::PostUpdate => "postUpdate",
            LifecycleEvent::PreRemove => "preRemove",
            LifecycleEvent::PostRemove => "postRemove",
            LifecycleEvent::PostFlush => "postFlush",
        }
    }
}

/// What a listener is handed when an event fires. `entity`/`handle` are
/// absent for `PreFlush`/`PostFlush`, which are not entity-scoped.
///
/// `scheduled` lets a listener introduce brand-new entities for the engine to
/// persist (e.g. `postPersist` creating an audit row): the listener has no
/// other way to reach back into the engine, so it pushes here instead, and
/// the flush orchestrator drains the buffer between phases (SPEC_FULL.md
/// §4.5's re-entrancy rule).
pub struct EventContext<'a> {
    pub event: LifecycleEvent,
    pub entity: Option<&'a mut dyn Entity>,
    pub handle: Option<EntityHandle>,
    pub change_set: Option<&'a ChangeSet>,
    pub scheduled: &'a mut Vec<Box<dyn Entity>>,
}

pub trait Listener: Send + Sync {
    fn handle(&self, ctx: &mut EventContext<'_>) -> Result<()>;
}

/// A listener built from a plain closure, for tests and simple call sites
/// that don't want to define a type implementing `Listener`.
pub struct FnListener<F>(pub F)
where
    F: Fn(&mut EventContext<'_>) -> Result<()> + Send + Sync;

impl<F> Listener for FnListener<F>
where
    F: Fn(&mut EventContext<'_>) -> Result<()> + Send + Sync,
{
    fn handle(&self, ctx: &mut EventContext<'_>) -> Result<()> {
        (self.0)(ctx)
    }
}

#[derive(Default)]
pub struct EventDispatcher {
    listeners: Vec<(LifecycleEvent, Box<dyn Listener>)>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event: LifecycleEvent, listener: Box<dyn Listener>) {
        self.listeners.push((event, listener));
    }

    /// Runs every listener registered for `ctx.event`, in registration order.
    /// The first error aborts dispatch and propagates to the caller, which
    /// per §4.7/§4.5 aborts the flush.
    pub fn dispatch(&self, ctx: &mut EventContext<'_>) -> Result<()> {
        let event = ctx.event;
        tracing::trace!(event = event.as_str(), "dispatching lifecycle event");
        for (registered_event, listener) in &self.listeners {
            if *registered_event == event {
                listener.handle(ctx)?;
            }
        }
        Ok(())
    }
}
