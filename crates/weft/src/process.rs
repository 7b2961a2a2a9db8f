use std::{cell::Cell, rc::Rc};

use tracing::{event, Level};

use crate::{Event, EventEmitter, Subscription};

/// Lifecycle events of the running process.
pub enum ProcessEvent {
    /// The event loop ran out of work and is about to return.
    Exit,
}

impl Event for ProcessEvent {
    fn name(&self) -> &'static str {
        match self {
            ProcessEvent::Exit => "exit",
        }
    }
}

/// Process-wide lifecycle emitter, emitting "exit" once when the event loop finishes.
#[derive(Default, Clone)]
pub struct Process {
    events: EventEmitter<ProcessEvent>,
    exited: Rc<Cell<bool>>,
}

impl Process {
    pub fn events(&self) -> &EventEmitter<ProcessEvent> {
        &self.events
    }

    /// Register a listener for the "exit" event.
    pub fn on_exit<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + 'static,
    {
        self.events.on("exit", move |_| listener())
    }

    /// Emit "exit", returns false if it was already emitted before.
    pub fn emit_exit(&self) -> bool {
        if self.exited.replace(true) {
            return false;
        }

        event!(Level::DEBUG, "emitting exit");
        self.events.emit(&ProcessEvent::Exit);

        true
    }

    pub fn has_exited(&self) -> bool {
        self.exited.get()
    }
}
