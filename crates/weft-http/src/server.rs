use std::{
    cell::{Cell, RefCell},
    io::ErrorKind,
    net::SocketAddr,
    rc::Rc,
};

use anyhow::Error;
use tracing::{event, instrument, Level};
use weft::{Actor, Event, EventEmitter, Mailbox, Meta, Runtime, Signal, Subscription};
use weft_mio::{
    net::{tcp, NetError},
    Context,
};

use crate::{connection, HttpError, Request, Response, ServerOptions};

type Handler = dyn Fn(&Server, Request, Response);

/// Lifecycle events of a server.
#[derive(Debug, Clone, Copy)]
pub enum ServerEvent {
    /// The server bound its address and accepts connections.
    Listening(SocketAddr),
    /// A connection from the given remote address was accepted.
    Connection(SocketAddr),
    /// A connection from the given remote address closed.
    Disconnect(SocketAddr),
    /// The server stopped accepting connections.
    Close,
}

impl Event for ServerEvent {
    fn name(&self) -> &'static str {
        match self {
            ServerEvent::Listening(_) => "listening",
            ServerEvent::Connection(_) => "connection",
            ServerEvent::Disconnect(_) => "disconnect",
            ServerEvent::Close => "close",
        }
    }
}

/// Create an HTTP server, calling `handler` for every request received.
///
/// The handler is called as soon as a request's head is parsed, the body arrives after.
pub fn create_server<H>(cx: &Context, handler: H) -> Server
where
    H: Fn(&Server, Request, Response) + 'static,
{
    Server::with_options(cx, ServerOptions::default(), handler)
}

/// Handle to an HTTP server.
///
/// Cheap to clone, every clone refers to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

struct ServerInner {
    cx: Context,
    options: ServerOptions,
    handler: Box<Handler>,
    events: EventEmitter<ServerEvent>,
    listener: RefCell<Option<tcp::Listener>>,
    connections: Cell<usize>,
}

impl Server {
    pub fn with_options<H>(cx: &Context, options: ServerOptions, handler: H) -> Self
    where
        H: Fn(&Server, Request, Response) + 'static,
    {
        let inner = ServerInner {
            cx: cx.clone(),
            options,
            handler: Box::new(handler),
            events: EventEmitter::new(),
            listener: RefCell::new(None),
            connections: Cell::new(0),
        };

        Self {
            inner: Rc::new(inner),
        }
    }

    pub fn events(&self) -> &EventEmitter<ServerEvent> {
        &self.inner.events
    }

    /// Register a listener for a server event by name.
    pub fn on<F>(&self, name: &'static str, listener: F) -> Subscription
    where
        F: Fn(&ServerEvent) + 'static,
    {
        self.inner.events.on(name, listener)
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    /// Bind `addr` and start accepting connections, returning the bound address.
    #[instrument("http::listen", skip_all)]
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, HttpError> {
        if self.inner.listener.borrow().is_some() {
            return Err(HttpError::AlreadyListening);
        }

        let signal = Signal::default();
        let listener_events = Mailbox::new(signal.clone());

        let listener = match tcp::listen(&self.inner.cx, addr, listener_events.sender()) {
            Ok(listener) => listener,
            Err(NetError::Io(error)) if error.kind() == ErrorKind::AddrInUse => {
                return Err(HttpError::AddressInUse(addr));
            }
            Err(error) => return Err(error.into()),
        };
        let local_addr = listener.local_addr();

        let actor = Service {
            server: self.clone(),
            listener_events,
        };
        self.inner
            .cx
            .handle()
            .insert("http-server", &signal, actor)
            .map_err(|error| HttpError::Runtime(error.into()))?;

        *self.inner.listener.borrow_mut() = Some(listener);

        event!(Level::INFO, addr = ?local_addr, "listening");
        self.inner.events.emit(&ServerEvent::Listening(local_addr));

        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .borrow()
            .as_ref()
            .map(tcp::Listener::local_addr)
    }

    /// Stop accepting connections.
    ///
    /// Connections already accepted keep running until they finish.
    pub fn close(&self) {
        let listener = self.inner.listener.borrow_mut().take();

        if let Some(listener) = listener {
            event!(Level::DEBUG, "closing server");
            if listener.close().is_err() {
                event!(Level::DEBUG, "listener already gone");
            }
        }
    }

    /// Number of connections currently open.
    pub fn connections(&self) -> usize {
        self.inner.connections.get()
    }

    pub(crate) fn cx(&self) -> &Context {
        &self.inner.cx
    }

    pub(crate) fn handle_request(&self, request: Request, response: Response) {
        (self.inner.handler)(self, request, response);
    }

    pub(crate) fn on_connected(&self, remote_addr: SocketAddr) {
        self.inner.connections.set(self.inner.connections.get() + 1);
        self.inner.events.emit(&ServerEvent::Connection(remote_addr));
    }

    pub(crate) fn on_disconnected(&self, remote_addr: SocketAddr) {
        self.inner.connections.set(self.inner.connections.get().saturating_sub(1));
        self.inner.events.emit(&ServerEvent::Disconnect(remote_addr));
    }
}

struct Service {
    server: Server,
    listener_events: Mailbox<tcp::ListenerEvent>,
}

impl Actor for Service {
    fn process(&mut self, _rt: &mut Runtime, meta: &mut Meta) -> Result<(), Error> {
        while let Some(event) = self.listener_events.recv() {
            match event {
                tcp::ListenerEvent::Connected(event) => {
                    connection::open(&self.server, event)?;
                }
                tcp::ListenerEvent::Closed => {
                    event!(Level::DEBUG, "listener closed");

                    // The listener may also close on its own when failing
                    self.server.inner.listener.borrow_mut().take();
                    self.server.inner.events.emit(&ServerEvent::Close);

                    meta.set_stop();
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}
