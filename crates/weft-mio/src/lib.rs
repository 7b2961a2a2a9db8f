//! Mio backed event loop and I/O services for weft actors.

mod event_loop;
pub mod fs;
pub mod net;
mod registry;

pub use self::{
    event_loop::{run_event_loop, Context},
    registry::{Ready, ReadyRef, Registry},
};
