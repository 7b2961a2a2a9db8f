use std::{
    cell::Cell,
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr},
    rc::Rc,
    time::Duration,
};

use anyhow::Error;
use bytes::{Buf, Bytes};
use mio::Interest;
use tracing::{event, instrument, Level};
use weft::{Actor, Mailbox, Meta, Runtime, Sender, Signal, TimerHandle, Timers};

use crate::{net::NetError, Context, Ready, ReadyRef};

pub enum StreamAction {
    /// Queue data to be sent.
    Send(Bytes),
    /// Close the stream after all queued data has been sent.
    Close,
    /// Close the stream immediately, discarding queued data.
    ForceClose,
    /// Stop reading from the stream until resumed.
    PauseRead,
    ResumeRead,
    /// Set the idle timeout, or disable it with `None`.
    SetTimeout(Option<Duration>),
}

pub enum StreamEvent {
    /// An outgoing stream finished connecting, or an incoming stream was accepted.
    Connected,
    Recv(RecvEvent),
    /// The remote end will not send any more data.
    Eof,
    /// No data was sent or received within the idle timeout.
    Timeout,
    /// The stream closed, and the actor stopped.
    Closed(ClosedEvent),
}

pub struct RecvEvent {
    pub data: Bytes,
}

pub struct ClosedEvent {
    /// The error that caused the stream to close, if any.
    pub error: Option<io::Error>,
}

/// Which directions of a stream are still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Opening,
    Open,
    ReadOnly,
    WriteOnly,
    Closed,
}

/// Handle to a TCP stream actor.
///
/// After `close` or `force_close`, every further operation fails with `NetError::Closed`.
#[derive(Clone)]
pub struct Stream {
    actions: Sender<StreamAction>,
    state: Rc<Cell<ReadyState>>,
    closed: Rc<Cell<bool>>,
    peer_addr: SocketAddr,
}

impl Stream {
    /// Queue `data` to be sent on the stream.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), NetError> {
        self.action(StreamAction::Send(data.into()))
    }

    /// Close gracefully, after everything queued has been sent.
    pub fn close(&self) -> Result<(), NetError> {
        self.action(StreamAction::Close)?;
        self.closed.set(true);
        Ok(())
    }

    pub fn force_close(&self) -> Result<(), NetError> {
        self.action(StreamAction::ForceClose)?;
        self.closed.set(true);
        Ok(())
    }

    pub fn pause_read(&self) -> Result<(), NetError> {
        self.action(StreamAction::PauseRead)
    }

    pub fn resume_read(&self) -> Result<(), NetError> {
        self.action(StreamAction::ResumeRead)
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), NetError> {
        self.action(StreamAction::SetTimeout(timeout))
    }

    /// Returns true once the stream was closed through this handle or any clone of it.
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn action(&self, action: StreamAction) -> Result<(), NetError> {
        if self.closed.get() || self.state.get() == ReadyState::Closed {
            return Err(NetError::Closed);
        }

        self.actions.send(action).map_err(|_| NetError::Closed)
    }
}

/// Open an outgoing TCP stream to `addr`.
///
/// The returned mailbox receives `StreamEvent::Connected` once the connection is established.
/// Data sent before then is queued.
#[instrument("tcp::connect", skip_all)]
pub fn connect(cx: &Context, addr: SocketAddr) -> Result<(Stream, Mailbox<StreamEvent>), NetError> {
    event!(Level::DEBUG, ?addr, "connecting");

    let stream = mio::net::TcpStream::connect(addr)?;
    open(cx, stream, addr, false)
}

pub(super) fn open(
    cx: &Context,
    mut stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
    connected: bool,
) -> Result<(Stream, Mailbox<StreamEvent>), NetError> {
    event!(Level::DEBUG, ?peer_addr, "opening stream");

    let signal = Signal::default();
    let actions = Mailbox::new(signal.clone());
    let timeouts = Mailbox::new(signal.clone());
    let events = Mailbox::floating();

    if connected {
        stream.set_nodelay(true)?;
    }

    // Register for mio events
    let ready = cx.registry().register(
        &mut stream,
        Interest::READABLE | Interest::WRITABLE,
        signal.clone(),
    )?;

    let initial = if connected {
        ReadyState::Open
    } else {
        ReadyState::Opening
    };
    let state = Rc::new(Cell::new(initial));

    let handle = Stream {
        actions: actions.sender(),
        state: state.clone(),
        closed: Rc::new(Cell::new(false)),
        peer_addr,
    };

    let actor = Service {
        actions,
        timeouts,
        events: events.sender(),
        timers: cx.timers().clone(),

        stream,
        ready,
        state,

        connected,
        read_closed: false,
        write_closed: false,
        closing: false,
        paused: false,
        read_pending: false,
        queue: VecDeque::new(),

        timeout: None,
        timer: None,
        timer_generation: 0,
        error: None,
    };

    if connected {
        event!(Level::TRACE, "stream accepted connected");
        events.sender().send(StreamEvent::Connected)?;
    }

    cx.handle().insert("tcp-stream", &signal, actor)?;

    Ok((handle, events))
}

struct Service {
    actions: Mailbox<StreamAction>,
    timeouts: Mailbox<u64>,
    events: Sender<StreamEvent>,
    timers: Timers,

    stream: mio::net::TcpStream,
    ready: ReadyRef,
    state: Rc<Cell<ReadyState>>,

    connected: bool,
    read_closed: bool,
    write_closed: bool,
    closing: bool,
    paused: bool,
    read_pending: bool,
    queue: VecDeque<Bytes>,

    timeout: Option<Duration>,
    timer: Option<TimerHandle>,
    timer_generation: u64,
    error: Option<io::Error>,
}

impl Drop for Service {
    fn drop(&mut self) {
        event!(Level::DEBUG, "closing stream");

        self.ready.deregister(&mut self.stream);
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.state.set(ReadyState::Closed);

        let event = ClosedEvent {
            error: self.error.take(),
        };
        if self.events.send(StreamEvent::Closed(event)).is_err() {
            event!(Level::DEBUG, "stream owner gone before close");
        }
    }
}

impl Actor for Service {
    fn process(&mut self, _rt: &mut Runtime, meta: &mut Meta) -> Result<(), Error> {
        let ready = self.ready.take();

        if !self.connected && !ready.is_empty() {
            self.check_connected(meta)?;
        }

        self.process_actions(meta)?;

        if self.connected && self.state.get() != ReadyState::Closed {
            self.process_ready(ready, meta)?;
        }

        self.process_timeouts()?;

        // The remote dropping the event mailbox means nothing listens anymore
        if self.events.is_closed() {
            event!(Level::DEBUG, "stream owner gone, stopping");
            self.state.set(ReadyState::Closed);
        }

        if self.state.get() == ReadyState::Closed {
            meta.set_stop();
        }

        Ok(())
    }
}

impl Service {
    fn check_connected(&mut self, meta: &mut Meta) -> Result<(), Error> {
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(error)) | Err(error) => {
                self.fail(error, meta);
                return Ok(());
            }
        }

        match self.stream.peer_addr() {
            Ok(_) => {}
            // Not connected yet, wait for the next ready event
            Err(error) if error.kind() == ErrorKind::NotConnected => return Ok(()),
            Err(error) => {
                self.fail(error, meta);
                return Ok(());
            }
        }

        event!(Level::DEBUG, "stream connected");
        self.stream.set_nodelay(true)?;
        self.connected = true;
        self.update_state();
        self.touch();

        self.events.send(StreamEvent::Connected)?;

        Ok(())
    }

    fn process_actions(&mut self, meta: &mut Meta) -> Result<(), Error> {
        while let Some(action) = self.actions.recv() {
            match action {
                StreamAction::Send(data) => {
                    if self.closing || self.write_closed {
                        event!(Level::WARN, "attempted to send on closing stream, dropping");
                        continue;
                    }

                    if !data.is_empty() {
                        self.queue.push_back(data);
                    }
                }
                StreamAction::Close => {
                    event!(Level::DEBUG, "graceful close requested");
                    self.closing = true;
                }
                StreamAction::ForceClose => {
                    event!(Level::DEBUG, "force close requested");
                    self.queue.clear();
                    self.state.set(ReadyState::Closed);
                    meta.set_stop();
                    return Ok(());
                }
                StreamAction::PauseRead => self.paused = true,
                StreamAction::ResumeRead => {
                    self.paused = false;

                    // Ready events are edge triggered, so data may already be waiting
                    self.read_pending = true;
                }
                StreamAction::SetTimeout(timeout) => {
                    self.timeout = timeout;
                    self.touch();
                }
            }
        }

        Ok(())
    }

    fn process_ready(&mut self, ready: Ready, meta: &mut Meta) -> Result<(), Error> {
        if ready.readable || self.read_pending {
            self.on_readable(meta)?;
        }

        if self.state.get() == ReadyState::Closed {
            return Ok(());
        }

        self.flush(meta);

        Ok(())
    }

    fn on_readable(&mut self, meta: &mut Meta) -> Result<(), Error> {
        if self.read_closed {
            return Ok(());
        }

        if self.paused {
            self.read_pending = true;
            return Ok(());
        }
        self.read_pending = false;

        let mut eof = false;
        let mut buffer = vec![0; 4096];
        let mut bytes_read = 0;

        loop {
            // Attempt to receive data
            let result = self.stream.read(&mut buffer[bytes_read..]);

            match result {
                Ok(len) => {
                    // Read of zero means the stream has been closed
                    if len == 0 {
                        eof = true;
                        break;
                    }

                    // Add additional read data to buffer
                    bytes_read += len;
                    if bytes_read == buffer.len() {
                        buffer.resize(buffer.len() * 2, 0);
                    }
                }
                Err(error) => match error.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    _ => {
                        self.fail(error, meta);
                        break;
                    }
                },
            }
        }

        // Send read data to listener
        if bytes_read != 0 {
            event!(Level::TRACE, count = bytes_read, "received data");
            buffer.truncate(bytes_read);

            let event = RecvEvent {
                data: Bytes::from(buffer),
            };
            self.events.send(StreamEvent::Recv(event))?;
            self.touch();
        }

        if eof {
            event!(Level::DEBUG, "remote closed stream");
            self.read_closed = true;
            self.update_state();

            self.events.send(StreamEvent::Eof)?;
        }

        Ok(())
    }

    fn flush(&mut self, meta: &mut Meta) {
        let mut written = 0;

        while let Some(front) = self.queue.front_mut() {
            match self.stream.write(front) {
                Ok(0) => {
                    self.fail(ErrorKind::WriteZero.into(), meta);
                    return;
                }
                Ok(len) => {
                    written += len;
                    front.advance(len);

                    if front.is_empty() {
                        self.queue.pop_front();
                    }
                }
                Err(error) => match error.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    _ => {
                        self.fail(error, meta);
                        return;
                    }
                },
            }
        }

        if written != 0 {
            event!(Level::TRACE, count = written, "sent data");
            self.touch();
        }

        // Graceful close shuts down the write half once everything's sent
        if self.closing && !self.write_closed && self.queue.is_empty() {
            event!(Level::DEBUG, "shutting down write half");

            if let Err(error) = self.stream.shutdown(Shutdown::Write) {
                if error.kind() != ErrorKind::NotConnected {
                    self.fail(error, meta);
                    return;
                }
            }

            self.write_closed = true;
            self.update_state();
        }
    }

    fn process_timeouts(&mut self) -> Result<(), Error> {
        while let Some(generation) = self.timeouts.recv() {
            // Timers superseded by activity may still have fired
            if generation != self.timer_generation || self.timeout.is_none() {
                continue;
            }

            event!(Level::DEBUG, "stream idle timeout");
            self.timer = None;
            self.events.send(StreamEvent::Timeout)?;
        }

        Ok(())
    }

    /// Restart the idle timer.
    fn touch(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }

        let Some(timeout) = self.timeout else {
            return;
        };

        self.timer_generation += 1;
        let generation = self.timer_generation;
        let sender = self.timeouts.sender();

        let timer = self.timers.after(timeout, move || {
            if sender.send(generation).is_err() {
                event!(Level::TRACE, "stream gone before timeout");
            }
        });
        self.timer = Some(timer);
    }

    fn fail(&mut self, error: io::Error, meta: &mut Meta) {
        event!(Level::DEBUG, ?error, "stream failed");

        self.error = Some(error);
        self.queue.clear();
        self.state.set(ReadyState::Closed);
        meta.set_stop();
    }

    fn update_state(&self) {
        let state = match (self.connected, self.read_closed, self.write_closed) {
            (false, _, _) => ReadyState::Opening,
            (true, false, false) => ReadyState::Open,
            (true, false, true) => ReadyState::ReadOnly,
            (true, true, false) => ReadyState::WriteOnly,
            (true, true, true) => ReadyState::Closed,
        };
        self.state.set(state);
    }
}
