use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::{Rc, Weak},
};

use thiserror::Error;
use tracing::{event, Level};

use super::{Signal, SignalError};

/// Shared *single-threaded* multi-sender message queue.
///
/// An instance of `Mailbox` is considered 'authoritative'.
/// You can use it to create senders, and register the actor that should be notified.
/// When the mailbox is dropped, all senders start failing with `SendError::Closed`.
pub struct Mailbox<M> {
    inner: Rc<RefCell<MailboxInner<M>>>,
}

struct MailboxInner<M> {
    queue: VecDeque<M>,
    signal: Option<Signal>,
}

impl<M> Mailbox<M> {
    /// Create a new mailbox that sends `signal` when it receives a message.
    pub fn new(signal: Signal) -> Self {
        Self::with_signal(Some(signal))
    }

    /// Create a mailbox that isn't yet associated with any actor.
    ///
    /// Messages are queued until a signal is set with `set_signal`, or received manually.
    pub fn floating() -> Self {
        Self::with_signal(None)
    }

    fn with_signal(signal: Option<Signal>) -> Self {
        let inner = MailboxInner {
            queue: VecDeque::new(),
            signal,
        };

        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// Create a new `Sender` that sends to this mailbox.
    pub fn sender(&self) -> Sender<M> {
        Sender {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Set the `Signal` to be sent when this mailbox receives a message.
    ///
    /// Only one signal can be set at a time, setting this will remove the previous value.
    /// If messages are already waiting, the signal is sent immediately.
    pub fn set_signal(&self, signal: Signal) {
        let pending = {
            let mut inner = self.inner.borrow_mut();
            inner.signal = Some(signal.clone());
            !inner.queue.is_empty()
        };

        if pending {
            if let Err(error) = signal.send() {
                event!(Level::WARN, ?error, "failed to signal pending messages");
            }
        }
    }

    /// Get the next message, if any is available.
    pub fn recv(&self) -> Option<M> {
        self.inner.borrow_mut().queue.pop_front()
    }
}

/// Sending utility, for sending messages to a mailbox.
pub struct Sender<M> {
    inner: Weak<RefCell<MailboxInner<M>>>,
}

impl<M> Sender<M> {
    /// Send a message to the target mailbox of this sender.
    pub fn send(&self, message: M) -> Result<(), SendError> {
        // Check if the mailbox is still available
        let Some(inner) = self.inner.upgrade() else {
            return Err(SendError::Closed);
        };

        let signal = {
            let mut inner = inner.borrow_mut();
            inner.queue.push_back(message);
            inner.signal.clone()
        };

        // Notify the listening actor after releasing the queue, it may be processing right now
        if let Some(signal) = signal {
            signal.send()?;
        }

        Ok(())
    }

    /// Returns true if the target mailbox has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl<M> Clone for Sender<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Error while sending a message.
#[derive(Error, Debug)]
pub enum SendError {
    /// The receiving mailbox no longer exists.
    #[error("mailbox closed")]
    Closed,
    /// The mailbox exists, but its actor could not be scheduled.
    #[error("failed to notify receiving actor")]
    Signal(#[from] SignalError),
}
