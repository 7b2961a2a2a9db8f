//! Single-threaded actor runtime and evented primitives.
//!
//! Actors are owned by a `Runtime`, and are woken up through `Signal`s when their mailboxes
//! receive messages. On top of this, `EventEmitter`, `Deferred` and `Timers` give callback-style
//! building blocks for I/O services driven by an event loop.

mod actor;
mod deferred;
mod events;
pub mod message;
mod process;
mod runtime;
mod schedule;
mod timer;

pub use self::{
    actor::{Actor, Meta},
    deferred::{Deferred, DeferredState},
    events::{Event, EventEmitter, Subscription},
    message::{Mailbox, SendError, Sender, Signal, SignalError},
    process::{Process, ProcessEvent},
    runtime::{Handle, Id, ProcessError, Runtime, RuntimeError},
    timer::{TimerHandle, Timers},
};
