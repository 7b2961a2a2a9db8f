use std::net::SocketAddr;

use anyhow::Error;
use mio::Interest;
use tracing::{event, instrument, Level};
use weft::{Actor, Mailbox, Meta, Runtime, SendError, Sender, Signal};

use crate::{
    net::{check_io, tcp, NetError},
    Context, ReadyRef,
};

/// Handle to an open TCP listener.
pub struct Listener {
    actions: Sender<ListenerAction>,
    local_addr: SocketAddr,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new streams, and close the listener.
    ///
    /// Streams already accepted are not affected.
    pub fn close(&self) -> Result<(), SendError> {
        self.actions.send(ListenerAction::Close)
    }

    pub fn is_closed(&self) -> bool {
        self.actions.is_closed()
    }
}

enum ListenerAction {
    Close,
}

pub enum ListenerEvent {
    /// A stream was accepted.
    Connected(ConnectedEvent),
    /// The listener closed, and will not accept more streams.
    Closed,
}

pub struct ConnectedEvent {
    pub stream: tcp::Stream,
    pub events: Mailbox<tcp::StreamEvent>,
}

/// Open a TCP stream listener on the given address.
///
/// TCP, unlike UDP, works with ongoing connections.
/// Before a connection is established, you first need to 'listen' for those on a port.
/// The socket is bound immediately, so address errors are returned from this function.
#[instrument("tcp::listen", skip_all)]
pub fn listen(
    cx: &Context,
    addr: SocketAddr,
    events: Sender<ListenerEvent>,
) -> Result<Listener, NetError> {
    event!(Level::DEBUG, ?addr, "binding");

    let signal = Signal::default();
    let actions = Mailbox::new(signal.clone());

    // Create the socket
    let mut listener = mio::net::TcpListener::bind(addr)?;
    let local_addr = listener.local_addr()?;

    // Register the socket for ready events
    let ready = cx
        .registry()
        .register(&mut listener, Interest::READABLE, signal.clone())?;

    let handle = Listener {
        actions: actions.sender(),
        local_addr,
    };

    let actor = Service {
        cx: cx.clone(),
        actions,
        events,

        listener,
        ready,
    };
    cx.handle().insert("tcp-listener", &signal, actor)?;

    Ok(handle)
}

struct Service {
    cx: Context,
    actions: Mailbox<ListenerAction>,
    events: Sender<ListenerEvent>,

    listener: mio::net::TcpListener,
    ready: ReadyRef,
}

impl Drop for Service {
    fn drop(&mut self) {
        event!(Level::DEBUG, "closing listener");

        self.ready.deregister(&mut self.listener);
        if self.events.send(ListenerEvent::Closed).is_err() {
            event!(Level::DEBUG, "listener owner gone before close");
        }
    }
}

impl Actor for Service {
    fn process(&mut self, _rt: &mut Runtime, meta: &mut Meta) -> Result<(), Error> {
        while let Some(action) = self.actions.recv() {
            match action {
                ListenerAction::Close => {
                    meta.set_stop();
                    return Ok(());
                }
            }
        }

        let ready = self.ready.take();
        if ready.readable {
            self.on_listener_ready(meta)?;
        }

        Ok(())
    }
}

impl Service {
    fn on_listener_ready(&mut self, meta: &mut Meta) -> Result<(), Error> {
        // Accept any pending streams
        while let Some((stream, remote_addr)) = check_io(self.listener.accept())? {
            event!(Level::DEBUG, ?remote_addr, "stream accepted");

            // Start actor
            let (stream, events) = tcp::stream::open(&self.cx, stream, remote_addr, true)?;

            // Notify
            let event = ConnectedEvent { stream, events };
            match self.events.send(ListenerEvent::Connected(event)) {
                Ok(()) => {}
                Err(SendError::Closed) => {
                    event!(Level::DEBUG, "listener owner gone, stopping");
                    meta.set_stop();
                    break;
                }
                Err(error) => return Err(error.into()),
            }
        }

        Ok(())
    }
}
