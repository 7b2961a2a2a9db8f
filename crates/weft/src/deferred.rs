use std::{cell::RefCell, fmt, rc::Rc};

use tracing::{event, Level};

/// Single-resolution result container with success and failure callbacks.
///
/// A `Deferred` starts pending, and settles exactly once, either fulfilled with a value or
/// rejected with an error. Callbacks registered before settling are queued, callbacks registered
/// after settling are called immediately with the stored outcome.
///
/// Cloning a deferred gives another handle to the same outcome.
pub struct Deferred<T, E> {
    inner: Rc<RefCell<DeferredInner<T, E>>>,
}

struct DeferredInner<T, E> {
    outcome: Outcome<T, E>,
    success: Vec<Box<dyn FnOnce(&T)>>,
    failure: Vec<Box<dyn FnOnce(&E)>>,
}

enum Outcome<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

/// Current state of a `Deferred`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    Pending,
    Fulfilled,
    Rejected,
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        let inner = DeferredInner {
            outcome: Outcome::Pending,
            success: Vec::new(),
            failure: Vec::new(),
        };

        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("state", &self.state())
            .finish()
    }
}

impl<T, E> Deferred<T, E> {
    /// Create a new pending deferred.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a deferred that's already fulfilled with `value`.
    pub fn resolved(value: T) -> Self {
        let this = Self::new();
        this.resolve(value);
        this
    }

    /// Create a deferred that's already rejected with `error`.
    pub fn rejected(error: E) -> Self {
        let this = Self::new();
        this.reject(error);
        this
    }

    pub fn state(&self) -> DeferredState {
        match self.inner.borrow().outcome {
            Outcome::Pending => DeferredState::Pending,
            Outcome::Fulfilled(_) => DeferredState::Fulfilled,
            Outcome::Rejected(_) => DeferredState::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == DeferredState::Pending
    }

    /// Fulfill the deferred, calling all queued success callbacks in registration order.
    ///
    /// Returns false, without changing the outcome, if the deferred was already settled.
    pub fn resolve(&self, value: T) -> bool {
        // Callbacks may still be running with the outcome borrowed
        if !self.is_pending() {
            event!(Level::TRACE, "deferred already settled, ignoring resolve");
            return false;
        }

        let callbacks = {
            let mut inner = self.inner.borrow_mut();

            inner.outcome = Outcome::Fulfilled(value);
            inner.failure.clear();
            std::mem::take(&mut inner.success)
        };

        let inner = self.inner.borrow();
        if let Outcome::Fulfilled(value) = &inner.outcome {
            for callback in callbacks {
                callback(value);
            }
        }

        true
    }

    /// Reject the deferred, calling all queued failure callbacks in registration order.
    ///
    /// Returns false, without changing the outcome, if the deferred was already settled.
    pub fn reject(&self, error: E) -> bool {
        // Callbacks may still be running with the outcome borrowed
        if !self.is_pending() {
            event!(Level::TRACE, "deferred already settled, ignoring reject");
            return false;
        }

        let callbacks = {
            let mut inner = self.inner.borrow_mut();

            inner.outcome = Outcome::Rejected(error);
            inner.success.clear();
            std::mem::take(&mut inner.failure)
        };

        if callbacks.is_empty() {
            // Kept for late listeners
            event!(Level::DEBUG, "deferred rejected without failure listener");
        }

        let inner = self.inner.borrow();
        if let Outcome::Rejected(error) = &inner.outcome {
            for callback in callbacks {
                callback(error);
            }
        }

        true
    }

    /// Register a callback for fulfillment.
    ///
    /// If already fulfilled, `callback` is called before this function returns.
    /// If rejected, `callback` is never called.
    pub fn on_success<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&T) + 'static,
    {
        match self.state() {
            DeferredState::Pending => {
                self.inner.borrow_mut().success.push(Box::new(callback));
                return self;
            }
            DeferredState::Rejected => return self,
            DeferredState::Fulfilled => {}
        }

        let inner = self.inner.borrow();
        if let Outcome::Fulfilled(value) = &inner.outcome {
            callback(value);
        }

        self
    }

    /// Register a callback for rejection.
    ///
    /// If already rejected, `callback` is called before this function returns.
    /// If fulfilled, `callback` is never called.
    pub fn on_failure<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&E) + 'static,
    {
        match self.state() {
            DeferredState::Pending => {
                self.inner.borrow_mut().failure.push(Box::new(callback));
                return self;
            }
            DeferredState::Fulfilled => return self,
            DeferredState::Rejected => {}
        }

        let inner = self.inner.borrow();
        if let Outcome::Rejected(error) = &inner.outcome {
            callback(error);
        }

        self
    }
}
