use std::{
    io::ErrorKind,
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::{Context as _, Error};
use mio::{Events, Token};
use tracing::{event, instrument, Level};
use weft::{Handle, Process, Runtime, Subscription, TimerHandle, Timers};

use crate::{fs::FsPool, Ready, Registry};

/// Shared services of a running event loop.
///
/// Cheap to clone, every clone refers to the same loop.
#[derive(Clone)]
pub struct Context {
    handle: Handle,
    registry: Registry,
    timers: Timers,
    process: Process,
    fs: Rc<FsPool>,
}

impl Context {
    /// Handle for inserting actors into the loop's runtime.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub(crate) fn fs(&self) -> &FsPool {
        &self.fs
    }

    /// Call `callback` once on the loop thread, after `delay`.
    pub fn after<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        self.timers.after(delay, callback)
    }

    /// Call `callback` on the loop thread every `period`.
    pub fn every<F>(&self, period: Duration, callback: F) -> TimerHandle
    where
        F: FnMut() + 'static,
    {
        self.timers.every(period, callback)
    }

    /// Register a listener for the process "exit" event, emitted when the loop runs out of work.
    pub fn on_exit<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + 'static,
    {
        self.process.on_exit(listener)
    }
}

/// Run an event loop until it runs out of work.
///
/// The loop exits once no actors are alive, no timers are pending, and no filesystem jobs are
/// outstanding. After that, the "exit" process event is emitted once.
#[instrument("weft-event-loop", skip_all)]
pub fn run_event_loop<I>(init: I) -> Result<(), Error>
where
    I: FnOnce(&mut Runtime, &Context) -> Result<(), Error>,
{
    let mut rt = Runtime::default();

    // Initialize mio context
    let registry = Registry::new().context("failed to create poll")?;
    let (fs_token, waker) = registry.waker().context("failed to create waker")?;

    let cx = Context {
        handle: rt.handle(),
        registry,
        timers: Timers::default(),
        process: Process::default(),
        fs: Rc::new(FsPool::new(waker)),
    };

    // User init
    init(&mut rt, &cx)?;

    // Run the inner mio loop
    let result = run_poll_loop(&mut rt, &cx, fs_token);
    if let Err(error) = &result {
        event!(Level::ERROR, "error in event pipeline: {:?}", error);
    }

    cx.process.emit_exit();

    result
}

fn run_poll_loop(rt: &mut Runtime, cx: &Context, fs_token: Token) -> Result<(), Error> {
    let mut events = Events::with_capacity(128);

    loop {
        cx.timers.fire_due(Instant::now());

        // Process all pending actor messages, including wake events
        event!(Level::TRACE, "processing pending actors");
        rt.run_until_idle()?;

        if rt.is_empty() && !cx.timers.is_pending() && !cx.fs.is_pending() {
            event!(Level::DEBUG, "no work left, stopping");
            break;
        }

        let timeout = cx
            .timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        if let Err(error) = cx.registry.poll(&mut events, timeout) {
            if error.kind() == ErrorKind::Interrupted {
                continue;
            }

            return Err(error.into());
        }

        // Send out wake events
        for event in events.iter() {
            if event.token() == fs_token {
                cx.fs.dispatch();
                continue;
            }

            let ready = Ready {
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
                error: event.is_error(),
            };
            cx.registry.wake(event.token(), ready);
        }
    }

    Ok(())
}
