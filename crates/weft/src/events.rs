use std::{cell::RefCell, rc::Rc};

use tracing::{event, Level};

/// A typed event that can be dispatched through an `EventEmitter`.
pub trait Event: 'static {
    /// Name listeners subscribe to for this event.
    fn name(&self) -> &'static str;
}

/// Named-event subscription and synchronous dispatch.
///
/// Listeners for the same name fire in registration order, all receiving the same event.
/// Emitting is re-entrant: listeners may emit again, and may add or remove listeners.
/// Listeners added while an emit is running are not called by that emit.
///
/// Cloning an emitter gives another handle to the same listeners.
pub struct EventEmitter<E> {
    inner: Rc<RefCell<EmitterInner<E>>>,
}

struct EmitterInner<E> {
    next_id: u64,
    listeners: Vec<ListenerEntry<E>>,
}

struct ListenerEntry<E> {
    subscription: Subscription,
    name: &'static str,
    listener: Rc<dyn Fn(&E)>,
}

/// Handle to a registered listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        let inner = EmitterInner {
            next_id: 0,
            listeners: Vec::new(),
        };

        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> EventEmitter<E>
where
    E: Event,
{
    /// Create an emitter without any listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events named `name`.
    pub fn on<F>(&self, name: &'static str, listener: F) -> Subscription
    where
        F: Fn(&E) + 'static,
    {
        let mut inner = self.inner.borrow_mut();

        let subscription = Subscription { id: inner.next_id };
        inner.next_id += 1;

        inner.listeners.push(ListenerEntry {
            subscription,
            name,
            listener: Rc::new(listener),
        });

        subscription
    }

    /// Remove a listener, returns false if it was already removed.
    pub fn off(&self, subscription: Subscription) -> bool {
        let mut inner = self.inner.borrow_mut();

        let before = inner.listeners.len();
        inner
            .listeners
            .retain(|entry| entry.subscription != subscription);

        inner.listeners.len() != before
    }

    /// Number of listeners registered for `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.inner
            .borrow()
            .listeners
            .iter()
            .filter(|entry| entry.name == name)
            .count()
    }

    /// Call every listener registered for the event's name, returning how many were called.
    pub fn emit(&self, event: &E) -> usize {
        let name = event.name();

        // Collect first, so listeners can freely use the emitter
        let listeners: Vec<_> = self
            .inner
            .borrow()
            .listeners
            .iter()
            .filter(|entry| entry.name == name)
            .map(|entry| entry.listener.clone())
            .collect();

        event!(Level::TRACE, name, count = listeners.len(), "emitting");

        for listener in &listeners {
            listener(event);
        }

        listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    enum TestEvent {
        Data(u32),
        End,
    }

    impl Event for TestEvent {
        fn name(&self) -> &'static str {
            match self {
                TestEvent::Data(_) => "data",
                TestEvent::End => "end",
            }
        }
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let emitter = EventEmitter::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let log = log.clone();
            emitter.on("data", move |event: &TestEvent| {
                if let TestEvent::Data(value) = event {
                    log.borrow_mut().push(format!("{tag}{value}"));
                }
            });
        }

        let called = emitter.emit(&TestEvent::Data(1));

        assert_eq!(called, 3);
        assert_eq!(*log.borrow(), ["a1", "b1", "c1"]);
    }

    #[test]
    fn unregistered_name_is_noop() {
        let emitter = EventEmitter::new();
        emitter.on("data", |_: &TestEvent| panic!("wrong listener"));

        assert_eq!(emitter.emit(&TestEvent::End), 0);
    }

    #[test]
    fn off_removes_only_that_listener() {
        let emitter = EventEmitter::new();
        let count = Rc::new(RefCell::new(0));

        let first = {
            let count = count.clone();
            emitter.on("end", move |_: &TestEvent| *count.borrow_mut() += 1)
        };
        {
            let count = count.clone();
            emitter.on("end", move |_: &TestEvent| *count.borrow_mut() += 10);
        }

        assert!(emitter.off(first));
        assert!(!emitter.off(first));

        emitter.emit(&TestEvent::End);
        assert_eq!(*count.borrow(), 10);
        assert_eq!(emitter.listener_count("end"), 1);
    }

    #[test]
    fn reentrant_emit_recurses() {
        let emitter: EventEmitter<TestEvent> = EventEmitter::new();
        let ends = Rc::new(RefCell::new(0));

        {
            let inner = emitter.clone();
            emitter.on("data", move |_| {
                inner.emit(&TestEvent::End);
            });
        }
        {
            let ends = ends.clone();
            emitter.on("end", move |_| *ends.borrow_mut() += 1);
        }

        emitter.emit(&TestEvent::Data(0));
        emitter.emit(&TestEvent::Data(0));

        assert_eq!(*ends.borrow(), 2);
    }

    #[test]
    fn listener_added_during_emit_waits_for_next() {
        let emitter: EventEmitter<TestEvent> = EventEmitter::new();
        let late = Rc::new(RefCell::new(0));

        {
            let inner = emitter.clone();
            let late = late.clone();
            emitter.on("end", move |_| {
                let late = late.clone();
                inner.on("data", move |_| *late.borrow_mut() += 1);
            });
        }

        emitter.emit(&TestEvent::End);
        assert_eq!(*late.borrow(), 0);

        emitter.emit(&TestEvent::Data(3));
        assert_eq!(*late.borrow(), 1);
    }
}
