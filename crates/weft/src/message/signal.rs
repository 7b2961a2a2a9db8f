use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use anyhow::{anyhow, Context, Error};
use thiserror::Error;
use thunderdome::Index;
use tracing::{event, instrument, Level};

use crate::schedule::Schedule;

/// Shared rebindable handle for scheduling an actor.
///
/// Can be bound *after* creation.
/// This makes initializing actors a lot easier, as sockets and mailboxes can be created with the
/// signal before the actor is inserted into a `Runtime`.
/// Signals sent before binding are remembered, and schedule the actor as soon as it is bound.
#[derive(Default, Clone)]
pub struct Signal {
    shared: Rc<RefCell<SignalState>>,
}

#[derive(Default)]
struct SignalState {
    target: Option<Target>,
    missed: bool,
}

struct Target {
    schedule: Weak<Schedule>,
    index: Index,
}

impl Signal {
    pub(crate) fn bind(&self, schedule: Weak<Schedule>, index: Index) -> Result<(), Error> {
        let missed = {
            let mut state = self.shared.borrow_mut();
            state.target = Some(Target {
                schedule: schedule.clone(),
                index,
            });
            std::mem::take(&mut state.missed)
        };

        if missed {
            let schedule = schedule.upgrade().context("runtime no longer exists")?;
            schedule.push(index);
        }

        Ok(())
    }

    /// Send the signal, scheduling the target actor for processing.
    #[instrument("Signal::send", level = "trace", skip_all)]
    pub fn send(&self) -> Result<(), SignalError> {
        let (schedule, index) = {
            let mut state = self.shared.borrow_mut();

            let Some(target) = &state.target else {
                event!(Level::TRACE, "signal not bound yet, remembering");
                state.missed = true;
                return Ok(());
            };

            (target.schedule.clone(), target.index)
        };

        let schedule = schedule
            .upgrade()
            .ok_or_else(|| anyhow!("runtime no longer exists"))?;
        schedule.push(index);

        Ok(())
    }
}

/// Failed to send signal.
#[derive(Error, Debug)]
#[error("failed to send signal")]
pub struct SignalError {
    #[from]
    source: Error,
}
