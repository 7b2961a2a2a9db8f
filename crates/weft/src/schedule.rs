use std::{
    cell::RefCell,
    collections::{HashSet, VecDeque},
};

use thunderdome::Index;
use tracing::{event, Level};

/// FIFO of signalled actors, each queued at most once.
///
/// Whether an index still refers to a live actor is up to the runtime, which skips stale
/// entries when it takes them from the queue.
#[derive(Default)]
pub(crate) struct Schedule {
    inner: RefCell<Queue>,
}

#[derive(Default)]
struct Queue {
    order: VecDeque<Index>,
    queued: HashSet<Index>,
}

impl Schedule {
    pub fn push(&self, index: Index) {
        let mut queue = self.inner.borrow_mut();

        if !queue.queued.insert(index) {
            event!(Level::TRACE, "actor already queued");
            return;
        }

        event!(Level::TRACE, "queueing actor");
        queue.order.push_back(index);
    }

    pub fn pop(&self) -> Option<Index> {
        let mut queue = self.inner.borrow_mut();

        let index = queue.order.pop_front()?;
        queue.queued.remove(&index);

        Some(index)
    }

    /// Drop a removed actor from the queue.
    pub fn forget(&self, index: Index) {
        let mut queue = self.inner.borrow_mut();

        if queue.queued.remove(&index) {
            queue.order.retain(|queued| *queued != index);
        }
    }
}
