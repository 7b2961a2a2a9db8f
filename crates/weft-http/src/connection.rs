use std::{
    cell::Cell,
    collections::VecDeque,
    net::SocketAddr,
    rc::Rc,
};

use anyhow::Error;
use bytes::{Bytes, BytesMut};
use tracing::{event, instrument, Level};
use weft::{Actor, EventEmitter, Mailbox, Meta, Runtime, Sender, Signal, Subscription};
use weft_mio::net::tcp;

use crate::{
    body::{BodyEncoding, BodyStream, Chunk, MessageEvent},
    head::{self, MessageHead, RequestHead, Version},
    parser::{HttpParser, MessageKind, ParserEvent, ParserState},
    writer, Headers, HttpError, Server, Uri,
};

/// Start the HTTP actor for a connection accepted by `server`.
#[instrument("http::connection", skip_all)]
pub(crate) fn open(server: &Server, event: tcp::ConnectedEvent) -> Result<(), Error> {
    let tcp::ConnectedEvent { stream, events } = event;
    let remote_addr = stream.peer_addr();
    event!(Level::DEBUG, ?remote_addr, "connection opened");

    let signal = Signal::default();
    let actions = Mailbox::new(signal.clone());
    events.set_signal(signal.clone());

    if let Some(timeout) = server.options().idle_timeout {
        stream.set_timeout(Some(timeout))?;
    }

    let actor = Service {
        server: server.clone(),
        stream,
        stream_events: events,
        actions,
        remote_addr,

        parser: HttpParser::new(MessageKind::Request, server.options().max_head_size),
        current: None,
        transactions: VecDeque::new(),
        next_transaction: 0,

        reading: true,
        close_sent: false,
    };
    server.cx().handle().insert("http-connection", &signal, actor)?;

    server.on_connected(remote_addr);

    Ok(())
}

/// An incoming request, given to the server's handler.
///
/// Cheap to clone, every clone refers to the same request.
#[derive(Clone)]
pub struct Request {
    head: Rc<RequestHead>,
    remote_addr: SocketAddr,
    body: BodyStream,
}

impl Request {
    pub fn method(&self) -> &str {
        &self.head.method
    }

    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Set how body chunks are decoded, this includes chunks kept while nothing listened.
    pub fn set_body_encoding(&self, encoding: BodyEncoding) {
        self.body.set_encoding(encoding);
    }

    pub fn on_body<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Chunk) + 'static,
    {
        self.body.on_body(listener)
    }

    /// Register a listener for the end of the request, called immediately if it already ended.
    pub fn on_complete<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + 'static,
    {
        self.body.on_complete(listener)
    }

    pub fn is_complete(&self) -> bool {
        self.body.is_complete()
    }

    pub fn events(&self) -> &EventEmitter<MessageEvent> {
        self.body.events()
    }
}

/// The response to a request, written back on the request's connection.
///
/// Cheap to clone, every clone refers to the same response.
#[derive(Clone)]
pub struct Response {
    transaction: u64,
    actions: Sender<ConnectionAction>,
    request_version: Version,
    keep_alive: bool,
    head_request: bool,
    state: Rc<Cell<ResponseState>>,
    close: Rc<Cell<bool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    Pending,
    Sending { chunked: bool, bodiless: bool },
    Finished,
}

impl Response {
    /// Send the status line and headers.
    ///
    /// Framing headers are added when `headers` contains none, using chunked encoding if the
    /// request allows it.
    pub fn send_header(&self, status: u16, headers: impl Into<Headers>) -> Result<(), HttpError> {
        match self.state.get() {
            ResponseState::Pending => {}
            ResponseState::Sending { .. } => return Err(HttpError::HeadersAlreadySent),
            ResponseState::Finished => return Err(HttpError::AlreadyFinished),
        }

        let mut headers = headers.into();
        let bodiless =
            self.head_request || (100..200).contains(&status) || status == 204 || status == 304;
        let mut close = !self.keep_alive || headers.has_token("connection", "close");

        let chunked = if headers.has_token("transfer-encoding", "chunked") {
            true
        } else if bodiless || headers.contains("content-length") {
            false
        } else if self.request_version == Version::Http11 {
            headers.append("Transfer-Encoding", "chunked");
            true
        } else {
            // Without framing the body ends when the connection closes
            close = true;
            false
        };

        if self.request_version == Version::Http10 && !close && !headers.contains("connection") {
            headers.append("Connection", "keep-alive");
        }

        let mut buffer = BytesMut::new();
        writer::write_response_head(
            &mut buffer,
            Version::Http11,
            status,
            writer::reason_phrase(status),
            &headers,
        );
        self.write(buffer.freeze())?;

        self.close.set(close);
        self.state.set(ResponseState::Sending { chunked, bodiless });

        Ok(())
    }

    /// Send a piece of the body.
    pub fn send_body(&self, data: impl AsRef<[u8]>) -> Result<(), HttpError> {
        let (chunked, bodiless) = match self.state.get() {
            ResponseState::Pending => return Err(HttpError::HeadersNotSent),
            ResponseState::Sending { chunked, bodiless } => (chunked, bodiless),
            ResponseState::Finished => return Err(HttpError::AlreadyFinished),
        };

        let data = data.as_ref();
        if bodiless {
            event!(Level::WARN, len = data.len(), "response has no body, dropping data");
            return Ok(());
        }
        if data.is_empty() {
            return Ok(());
        }

        let data = if chunked {
            let mut buffer = BytesMut::new();
            writer::write_chunk(&mut buffer, data);
            buffer.freeze()
        } else {
            Bytes::copy_from_slice(data)
        };

        self.write(data)
    }

    /// Complete the response, after which the connection moves on to the next request.
    pub fn finish(&self) -> Result<(), HttpError> {
        let chunked = match self.state.get() {
            ResponseState::Pending => return Err(HttpError::HeadersNotSent),
            ResponseState::Sending { chunked, bodiless } => chunked && !bodiless,
            ResponseState::Finished => return Err(HttpError::AlreadyFinished),
        };

        if chunked {
            let mut buffer = BytesMut::new();
            writer::write_last_chunk(&mut buffer);
            self.write(buffer.freeze())?;
        }

        let action = ConnectionAction::Finish {
            transaction: self.transaction,
            close: self.close.get(),
        };
        self.actions.send(action).map_err(|_| HttpError::Closed)?;
        self.state.set(ResponseState::Finished);

        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.state.get() == ResponseState::Finished
    }

    fn write(&self, data: Bytes) -> Result<(), HttpError> {
        let action = ConnectionAction::Write {
            transaction: self.transaction,
            data,
        };
        self.actions.send(action).map_err(|_| HttpError::Closed)
    }
}

enum ConnectionAction {
    Write { transaction: u64, data: Bytes },
    Finish { transaction: u64, close: bool },
}

/// One request/response exchange on the connection.
struct Transaction {
    id: u64,
    keep_alive: bool,
    /// Response data waiting for earlier responses to finish.
    queued: Vec<Bytes>,
    finished: bool,
}

struct Service {
    server: Server,
    stream: tcp::Stream,
    stream_events: Mailbox<tcp::StreamEvent>,
    actions: Mailbox<ConnectionAction>,
    remote_addr: SocketAddr,

    parser: HttpParser,
    current: Option<(BodyStream, bool)>,
    transactions: VecDeque<Transaction>,
    next_transaction: u64,

    reading: bool,
    close_sent: bool,
}

impl Drop for Service {
    fn drop(&mut self) {
        event!(Level::DEBUG, remote_addr = ?self.remote_addr, "connection closed");

        if !self.close_sent {
            if let Err(error) = self.stream.close() {
                event!(Level::DEBUG, ?error, "stream already gone");
            }
        }
        self.server.on_disconnected(self.remote_addr);
    }
}

impl Actor for Service {
    fn process(&mut self, _rt: &mut Runtime, meta: &mut Meta) -> Result<(), Error> {
        self.process_stream(meta)?;
        self.process_actions()?;
        self.check_close()?;

        Ok(())
    }
}

impl Service {
    fn process_stream(&mut self, meta: &mut Meta) -> Result<(), Error> {
        while let Some(event) = self.stream_events.recv() {
            match event {
                tcp::StreamEvent::Connected => {}
                tcp::StreamEvent::Recv(event) => self.on_recv(event.data),
                tcp::StreamEvent::Eof => self.on_eof(),
                tcp::StreamEvent::Timeout => {
                    event!(Level::DEBUG, "connection idle, closing");
                    self.reading = false;
                    self.transactions.clear();
                }
                tcp::StreamEvent::Closed(event) => {
                    if let Some(error) = event.error {
                        event!(Level::DEBUG, ?error, "connection failed");
                    }

                    // Nothing more can be sent
                    self.close_sent = true;
                    meta.set_stop();
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    fn on_recv(&mut self, mut data: Bytes) {
        event!(Level::TRACE, bytes = data.len(), "received data");

        loop {
            if !self.reading {
                if !data.is_empty() {
                    event!(Level::WARN, bytes = data.len(), "not reading requests, dropping data");
                }
                return;
            }

            match self.parser.consume(&mut data) {
                Ok(Some(event)) => self.on_parser_event(event),
                Ok(None) => return,
                Err(error) => {
                    event!(Level::WARN, ?error, "malformed request, closing connection");
                    self.on_malformed();
                    return;
                }
            }
        }
    }

    fn on_eof(&mut self) {
        event!(Level::DEBUG, "remote finished sending");

        if self.reading && self.parser.state() != ParserState::Error {
            match self.parser.finish() {
                Ok(Some(event)) => self.on_parser_event(event),
                Ok(None) => {}
                Err(error) => {
                    event!(Level::DEBUG, ?error, "request cut short");
                    self.on_malformed();
                }
            }
        }

        self.reading = false;
    }

    fn on_parser_event(&mut self, event: ParserEvent) {
        match event {
            ParserEvent::Head(MessageHead::Request(head)) => self.on_request(head),
            ParserEvent::Head(MessageHead::Response(_)) => {
                event!(Level::WARN, "unexpected response head on server connection");
            }
            ParserEvent::Body(data) => {
                if let Some((body, _)) = &self.current {
                    body.push(data);
                }
            }
            ParserEvent::Complete => {
                self.parser.reset();

                if let Some((body, keep_alive)) = self.current.take() {
                    // The request that asked to close is the last one read
                    if !keep_alive {
                        self.reading = false;
                    }
                    body.complete();
                }
            }
        }
    }

    fn on_request(&mut self, head: RequestHead) {
        event!(Level::DEBUG, method = %head.method, uri = %head.uri, "request received");

        let id = self.next_transaction;
        self.next_transaction += 1;

        let keep_alive = head::keep_alive(head.version, &head.headers);
        let head_request = head.method.eq_ignore_ascii_case("HEAD");
        let version = head.version;

        let body = BodyStream::default();
        self.current = Some((body.clone(), keep_alive));
        self.transactions.push_back(Transaction {
            id,
            keep_alive,
            queued: Vec::new(),
            finished: false,
        });

        let request = Request {
            head: Rc::new(head),
            remote_addr: self.remote_addr,
            body,
        };
        let response = Response {
            transaction: id,
            actions: self.actions.sender(),
            request_version: version,
            keep_alive,
            head_request,
            state: Rc::new(Cell::new(ResponseState::Pending)),
            close: Rc::new(Cell::new(false)),
        };

        self.server.handle_request(request, response);
    }

    fn on_malformed(&mut self) {
        // The partial request is discarded, responses to earlier ones are still sent
        if self.current.take().is_some() {
            self.transactions.pop_back();
        }
        self.reading = false;
    }

    fn process_actions(&mut self) -> Result<(), Error> {
        while let Some(action) = self.actions.recv() {
            match action {
                ConnectionAction::Write { transaction, data } => {
                    let front = self.transactions.front().map(|t| t.id);

                    if front == Some(transaction) {
                        self.stream.send(data)?;
                        continue;
                    }

                    match self.find(transaction) {
                        Some(entry) => entry.queued.push(data),
                        None => event!(Level::WARN, transaction, "write for unknown response"),
                    }
                }
                ConnectionAction::Finish { transaction, close } => {
                    let Some(entry) = self.find(transaction) else {
                        event!(Level::WARN, transaction, "finish for unknown response");
                        continue;
                    };
                    entry.finished = true;

                    if close || !entry.keep_alive {
                        self.reading = false;
                    }

                    self.flush_finished()?;
                }
            }
        }

        Ok(())
    }

    /// Send out responses in request order, as far as they're finished.
    fn flush_finished(&mut self) -> Result<(), Error> {
        while let Some(front) = self.transactions.front_mut() {
            for data in front.queued.drain(..) {
                self.stream.send(data)?;
            }

            if !front.finished {
                break;
            }

            event!(Level::TRACE, transaction = front.id, "response finished");
            self.transactions.pop_front();
        }

        Ok(())
    }

    fn check_close(&mut self) -> Result<(), Error> {
        if self.reading || self.close_sent || !self.transactions.is_empty() {
            return Ok(());
        }

        event!(Level::DEBUG, "closing connection");
        self.stream.close()?;
        self.close_sent = true;

        Ok(())
    }

    fn find(&mut self, id: u64) -> Option<&mut Transaction> {
        self.transactions.iter_mut().find(|t| t.id == id)
    }
}
