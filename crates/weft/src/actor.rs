use anyhow::Error;

use crate::{Id, Runtime};

/// Actor identity and implementation trait.
pub trait Actor: 'static {
    /// Perform a processing step.
    ///
    /// Called whenever the actor's `Signal` was sent since the last step.
    ///
    /// This function can return `Err` to signal a fatal error to the system.
    /// If this happens, the actor will be stopped and cleaned up appropriately to protect against
    /// inconsistent state.
    ///
    /// You should *always* prefer this over panicking, as this crashes the entire runtime.
    /// Instead of using `unwrap` or `expect`, use `context` from the `anyhow` crate.
    fn process(&mut self, rt: &mut Runtime, meta: &mut Meta) -> Result<(), Error>;
}

/// Metadata of an `Actor` during a processing step.
pub struct Meta {
    id: Id,
    stop: bool,
}

impl Meta {
    pub(crate) fn new(id: Id) -> Self {
        Self { id, stop: false }
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.stop
    }

    /// Get the id of the actor being processed.
    pub fn id(&self) -> Id {
        self.id
    }

    /// At the end of this processing step, stop the actor.
    pub fn set_stop(&mut self) {
        self.stop = true;
    }
}
