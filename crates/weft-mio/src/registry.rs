use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    rc::Rc,
    time::Duration,
};

use mio::{event::Source, Events, Interest, Poll, Token, Waker};
use tracing::{event, Level};
use weft::Signal;

/// Shared mio context registry.
///
/// Actors can use an instance of this registry to register for readiness events.
/// The registry is created by the event loop, and routes ready events to the signal given at
/// registration.
#[derive(Clone)]
pub struct Registry {
    inner: Rc<RegistryInner>,
}

struct RegistryInner {
    poll: RefCell<Poll>,
    next_token: Cell<usize>,
    entries: RefCell<HashMap<Token, Rc<ReadyShared>>>,
}

struct ReadyShared {
    ready: Cell<Ready>,
    signal: Signal,
}

impl Registry {
    pub(crate) fn new() -> io::Result<Self> {
        let inner = RegistryInner {
            poll: RefCell::new(Poll::new()?),
            next_token: Cell::new(0),
            entries: RefCell::default(),
        };

        Ok(Self {
            inner: Rc::new(inner),
        })
    }

    /// Create a new unique token for this registry.
    fn token(&self) -> Token {
        let index = self.inner.next_token.get();
        self.inner.next_token.set(index + 1);
        Token(index)
    }

    /// Register `source`, sending `signal` whenever it becomes ready.
    pub fn register<S>(
        &self,
        source: &mut S,
        interest: Interest,
        signal: Signal,
    ) -> io::Result<ReadyRef>
    where
        S: Source,
    {
        let token = self.token();

        self.inner
            .poll
            .borrow()
            .registry()
            .register(source, token, interest)?;

        let shared = Rc::new(ReadyShared {
            ready: Cell::new(Ready::default()),
            signal,
        });
        self.inner
            .entries
            .borrow_mut()
            .insert(token, shared.clone());

        let value = ReadyRef {
            registry: self.clone(),
            token,
            shared,
        };
        Ok(value)
    }

    pub(crate) fn waker(&self) -> io::Result<(Token, Waker)> {
        let token = self.token();
        let waker = Waker::new(self.inner.poll.borrow().registry(), token)?;
        Ok((token, waker))
    }

    pub(crate) fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.poll.borrow_mut().poll(events, timeout)
    }

    pub(crate) fn wake(&self, token: Token, ready: Ready) {
        let entries = self.inner.entries.borrow();

        // Sources may have been deregistered while events were already queued
        let Some(shared) = entries.get(&token) else {
            event!(Level::TRACE, ?token, "ready event for unknown token");
            return;
        };

        event!(Level::TRACE, ?token, "sending wake");
        shared.ready.set(shared.ready.get().merge(ready));

        if let Err(error) = shared.signal.send() {
            event!(Level::WARN, ?error, "failed to send wake signal");
        }
    }
}

/// Registration of a source in a `Registry`, tracking readiness since it was last taken.
pub struct ReadyRef {
    registry: Registry,
    token: Token,
    shared: Rc<ReadyShared>,
}

impl ReadyRef {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Take the readiness accumulated since the last call.
    pub fn take(&self) -> Ready {
        self.shared.ready.take()
    }

    /// Remove the source from the registry, after which no more ready events are routed.
    pub fn deregister<S>(&self, source: &mut S)
    where
        S: Source,
    {
        self.registry
            .inner
            .entries
            .borrow_mut()
            .remove(&self.token);

        let result = self.registry.inner.poll.borrow().registry().deregister(source);
        if let Err(error) = result {
            event!(Level::WARN, ?error, "failed to deregister source");
        }
    }
}

/// Readiness of a registered source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Ready {
    fn merge(self, other: Self) -> Self {
        Self {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
            error: self.error || other.error,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.error)
    }
}
