use std::{
    cell::RefCell,
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

use tracing::{event, Level};

/// Single-threaded timer queue.
///
/// Timers fire no earlier than their deadline, ordered by deadline, with ties broken by the order
/// they were scheduled in. Callbacks only run when the owner of the queue calls `fire_due`.
#[derive(Default, Clone)]
pub struct Timers {
    inner: Rc<RefCell<TimerQueue>>,
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    callbacks: HashMap<u64, TimerCallback>,
    next_id: u64,
    next_seq: u64,
    running: Option<u64>,
    cancel_running: bool,
}

enum TimerCallback {
    Once(Box<dyn FnOnce()>),
    Repeat {
        period: Duration,
        callback: Box<dyn FnMut()>,
    },
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed, the heap should pop the earliest deadline first
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl TimerQueue {
    fn push(&mut self, id: u64, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(TimerEntry { deadline, seq, id });
    }
}

impl Timers {
    /// Call `callback` once, after `delay` has passed.
    pub fn after<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        self.insert(delay, TimerCallback::Once(Box::new(callback)))
    }

    /// Call `callback` repeatedly, every `period`.
    pub fn every<F>(&self, period: Duration, callback: F) -> TimerHandle
    where
        F: FnMut() + 'static,
    {
        let callback = TimerCallback::Repeat {
            period,
            callback: Box::new(callback),
        };
        self.insert(period, callback)
    }

    fn insert(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let mut queue = self.inner.borrow_mut();

        let id = queue.next_id;
        queue.next_id += 1;

        event!(Level::TRACE, id, ?delay, "scheduling timer");
        queue.callbacks.insert(id, callback);
        queue.push(id, Instant::now() + delay);

        TimerHandle {
            id,
            queue: Rc::downgrade(&self.inner),
        }
    }

    /// Returns true if any timer has not fired or been cancelled yet.
    pub fn is_pending(&self) -> bool {
        !self.inner.borrow().callbacks.is_empty()
    }

    /// Deadline of the earliest timer still pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut queue = self.inner.borrow_mut();

        // Lazily drop entries of cancelled timers
        loop {
            let entry = queue.heap.peek()?;

            if queue.callbacks.contains_key(&entry.id) {
                return Some(entry.deadline);
            }

            queue.heap.pop();
        }
    }

    /// Fire all timers with a deadline at or before `now`, returning how many fired.
    ///
    /// Timers scheduled by callbacks during this call fire at the earliest next call.
    pub fn fire_due(&self, now: Instant) -> usize {
        let limit = self.inner.borrow().next_seq;
        let mut fired = 0;

        loop {
            let (id, callback) = {
                let mut queue = self.inner.borrow_mut();

                let Some(entry) = queue.heap.peek() else {
                    break;
                };
                if entry.deadline > now || entry.seq >= limit {
                    break;
                }

                let id = entry.id;
                queue.heap.pop();

                let Some(callback) = queue.callbacks.remove(&id) else {
                    continue;
                };

                queue.running = Some(id);
                queue.cancel_running = false;
                (id, callback)
            };

            event!(Level::TRACE, id, "firing timer");
            fired += 1;

            match callback {
                TimerCallback::Once(callback) => callback(),
                TimerCallback::Repeat {
                    period,
                    mut callback,
                } => {
                    callback();

                    let mut queue = self.inner.borrow_mut();
                    if !queue.cancel_running {
                        queue.callbacks.insert(id, TimerCallback::Repeat { period, callback });
                        queue.push(id, now + period);
                    }
                }
            }

            self.inner.borrow_mut().running = None;
        }

        fired
    }
}

/// Handle to a scheduled timer.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    queue: Weak<RefCell<TimerQueue>>,
}

impl TimerHandle {
    /// Cancel the timer, returns false if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut queue = queue.borrow_mut();

        if queue.callbacks.remove(&self.id).is_some() {
            event!(Level::TRACE, id = self.id, "cancelled timer");
            return true;
        }

        // A repeating timer can cancel itself from its own callback
        if queue.running == Some(self.id) && !queue.cancel_running {
            queue.cancel_running = true;
            return true;
        }

        false
    }
}
