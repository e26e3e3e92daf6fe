use std::collections::VecDeque;

use tracing::trace;

use crate::runtime::host::{EntityId, HostBridge};
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::script::ArgBag;
use crate::runtime::vm_bc::Vm;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub target: EntityId,
    pub event: String,
    pub args: ArgBag,
}

/// Events collected during one host update, dispatched in arrival order.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<QueuedEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, target: EntityId, event: impl Into<String>, args: ArgBag) {
        self.events.push_back(QueuedEvent {
            target,
            event: event.into(),
            args,
        });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Dispatches every queued event in FIFO order.
    ///
    /// A fault aborts only its own handler. All faults, nested ones
    /// included, are returned in the order they happened.
    pub fn drain(&mut self, vm: &mut Vm, host: &mut dyn HostBridge) -> Vec<RuntimeError> {
        let mut faults = Vec::new();

        while let Some(queued) = self.events.pop_front() {
            let Some(mut ctx) = host.take_context(queued.target) else {
                trace!(entity = queued.target, event = %queued.event, "no script; event dropped");
                continue;
            };

            let result = vm.dispatch(&mut ctx, &queued.event, &queued.args, host);
            host.return_context(queued.target, ctx);

            faults.extend(vm.take_nested_faults());
            if let Err(e) = result {
                faults.push(e);
            }
        }

        faults
    }
}
