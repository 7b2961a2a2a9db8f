use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::{Rc, Weak},
};

use anyhow::{Context, Error};
use thiserror::Error;
use thunderdome::{Arena, Index};
use tracing::{event, instrument, span, Level};

use crate::{schedule::Schedule, Actor, Meta, Signal};

/// Thread-local actor tracking and execution system.
pub struct Runtime {
    actors: Arena<ActorEntry>,
    schedule: Rc<Schedule>,
    inserts: Rc<RefCell<VecDeque<PendingInsert>>>,
}

struct ActorEntry {
    name: &'static str,
    actor: Option<Box<dyn Actor>>,
}

struct PendingInsert {
    name: &'static str,
    signal: Signal,
    actor: Box<dyn Actor>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            actors: Arena::new(),
            schedule: Rc::new(Schedule::default()),
            inserts: Rc::default(),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let mut names = Vec::new();

        for (_, entry) in &self.actors {
            names.push(entry.name);
        }

        if !names.is_empty() {
            event!(
                Level::WARN,
                ?names,
                "actors not cleaned up before runtime drop",
            );
        }
    }
}

impl Runtime {
    /// Insert an actor into the runtime, binding `signal` to it.
    ///
    /// The given `name` will be used in logging.
    #[instrument("Runtime::insert", level = "debug", skip_all)]
    pub fn insert<A>(&mut self, name: &'static str, signal: &Signal, actor: A) -> Id
    where
        A: Actor,
    {
        self.insert_boxed(name, signal, Box::new(actor))
    }

    fn insert_boxed(&mut self, name: &'static str, signal: &Signal, actor: Box<dyn Actor>) -> Id {
        event!(Level::DEBUG, name, "inserting actor");

        let entry = ActorEntry {
            name,
            actor: Some(actor),
        };
        let index = self.actors.insert(entry);

        // Binding may immediately schedule, if the signal was sent before insertion
        if let Err(error) = signal.bind(Rc::downgrade(&self.schedule), index) {
            event!(Level::ERROR, ?error, "failed to bind actor signal");
        }

        Id { index }
    }

    /// Get a handle that can insert actors from outside a processing step.
    pub fn handle(&self) -> Handle {
        Handle {
            inserts: Rc::downgrade(&self.inserts),
        }
    }

    /// Number of actors currently alive in the runtime.
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    /// Returns true if no actors are alive, and none are waiting to be inserted.
    pub fn is_empty(&self) -> bool {
        self.actors.len() == 0 && self.inserts.borrow().is_empty()
    }

    /// Process all pending signalled actors, until none are left pending.
    #[instrument("Runtime::run_until_idle", level = "trace", skip_all)]
    pub fn run_until_idle(&mut self) -> Result<(), ProcessError> {
        loop {
            self.apply_inserts();

            let Some(index) = self.schedule.pop() else {
                // Processing may have queued more inserts through a handle
                if self.inserts.borrow().is_empty() {
                    break;
                }
                continue;
            };

            // Signals can outlive their actor
            if !self.actors.contains(index) {
                event!(Level::TRACE, "skipping removed actor");
                continue;
            }

            self.process_actor(index).context("failed to process")?;
        }

        Ok(())
    }

    fn apply_inserts(&mut self) {
        loop {
            let next = self.inserts.borrow_mut().pop_front();
            let Some(pending) = next else { break };

            self.insert_boxed(pending.name, &pending.signal, pending.actor);
        }
    }

    fn process_actor(&mut self, index: Index) -> Result<(), Error> {
        let (name, mut actor) = self.borrow(index)?;

        let span = span!(Level::INFO, "actor", name);
        let _entered = span.enter();

        // Let the actor's implementation process
        event!(Level::TRACE, "calling actor");
        let mut meta = Meta::new(Id { index });
        let result = actor.process(self, &mut meta);

        // Return the actor now that we're done with it
        self.unborrow(index, actor)?;

        // Check if an error happened
        if let Err(error) = result {
            event!(Level::ERROR, "error in actor, stopping: {:#}", error);
            meta.set_stop();
        }

        if meta.is_stop_requested() {
            self.remove(index)?;
        }

        Ok(())
    }

    fn remove(&mut self, index: Index) -> Result<(), Error> {
        self.schedule.forget(index);
        let entry = self
            .actors
            .remove(index)
            .context("failed to find actor for removal")?;

        event!(Level::DEBUG, name = entry.name, "removed actor");

        // Dropping the actor may send messages, so this happens with nothing borrowed
        drop(entry);

        Ok(())
    }

    fn borrow(&mut self, index: Index) -> Result<(&'static str, Box<dyn Actor>), Error> {
        let entry = self.actors.get_mut(index).context("failed to find actor")?;
        let actor = entry
            .actor
            .take()
            .context("expected actor not available")?;

        Ok((entry.name, actor))
    }

    fn unborrow(&mut self, index: Index, actor: Box<dyn Actor>) -> Result<(), Error> {
        let entry = self
            .actors
            .get_mut(index)
            .context("failed to find actor for return")?;
        entry.actor = Some(actor);

        Ok(())
    }
}

/// Identifier of an actor inserted into a runtime.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Id {
    index: Index,
}

/// Handle for inserting actors into a `Runtime` without borrowing it.
///
/// Inserts are applied at the start of the next processing iteration of the runtime.
#[derive(Clone)]
pub struct Handle {
    inserts: Weak<RefCell<VecDeque<PendingInsert>>>,
}

impl Handle {
    /// Queue an actor for insertion, binding `signal` to it once inserted.
    pub fn insert<A>(&self, name: &'static str, signal: &Signal, actor: A) -> Result<(), RuntimeError>
    where
        A: Actor,
    {
        let inserts = self.inserts.upgrade().ok_or(RuntimeError::Gone)?;

        event!(Level::DEBUG, name, "queueing actor insert");
        let pending = PendingInsert {
            name,
            signal: signal.clone(),
            actor: Box::new(actor),
        };
        inserts.borrow_mut().push_back(pending);

        Ok(())
    }
}

/// Failed to use a runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The runtime has been dropped.
    #[error("runtime no longer exists")]
    Gone,
}

/// Failed to process actors.
#[derive(Error, Debug)]
#[error("failed to process actors")]
pub struct ProcessError {
    #[from]
    source: Error,
}
