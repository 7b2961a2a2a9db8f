use std::{net::SocketAddr, rc::Rc};

use anyhow::Error;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{event, instrument, Level};
use weft::{Actor, Deferred, EventEmitter, Mailbox, Meta, Runtime, Signal, Subscription};
use weft_mio::{net::tcp, Context};

use crate::{
    body::{BodyEncoding, BodyStream, Chunk, MessageEvent},
    head::{MessageHead, ResponseHead, Version},
    parser::{HttpParser, MessageKind, ParserEvent},
    writer, ClientOptions, Headers, HttpError,
};

/// Create an HTTP client sending requests to `addr`.
pub fn create_client(cx: &Context, addr: SocketAddr) -> Client {
    Client::with_options(cx, addr, ClientOptions::default())
}

/// HTTP client bound to one destination.
///
/// Every request opens its own connection, which is closed after the response.
#[derive(Clone)]
pub struct Client {
    inner: Rc<ClientInner>,
}

struct ClientInner {
    cx: Context,
    addr: SocketAddr,
    options: ClientOptions,
}

impl Client {
    pub fn with_options(cx: &Context, addr: SocketAddr, options: ClientOptions) -> Self {
        let inner = ClientInner {
            cx: cx.clone(),
            addr,
            options,
        };

        Self {
            inner: Rc::new(inner),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn get(&self, path: &str, headers: impl Into<Headers>) -> ClientRequest {
        self.request("GET", path, headers)
    }

    pub fn post(
        &self,
        path: &str,
        headers: impl Into<Headers>,
        body: impl AsRef<[u8]>,
    ) -> ClientRequest {
        let mut request = self.request("POST", path, headers);
        request.send_body(body);
        request
    }

    /// Create a request, nothing is sent until it's finished.
    pub fn request(&self, method: &str, path: &str, headers: impl Into<Headers>) -> ClientRequest {
        ClientRequest {
            client: self.clone(),
            method: method.to_string(),
            path: path.to_string(),
            headers: headers.into(),
            body: BytesMut::new(),
        }
    }
}

/// A request that hasn't been sent yet.
pub struct ClientRequest {
    client: Client,
    method: String,
    path: String,
    headers: Headers,
    body: BytesMut,
}

impl ClientRequest {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Append data to the request body.
    pub fn send_body(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        self.body.put_slice(data.as_ref());
        self
    }

    /// Send the request.
    ///
    /// `on_response` is called once the response head arrives, so body listeners can be
    /// registered. The returned deferred resolves once the response is complete, or rejects if
    /// the exchange fails.
    #[instrument("http::request", skip_all)]
    pub fn finish<F>(self, on_response: F) -> Deferred<ClientResponse, HttpError>
    where
        F: FnOnce(&ClientResponse) + 'static,
    {
        let deferred = Deferred::new();

        if let Err(error) = self.start(Box::new(on_response), deferred.clone()) {
            event!(Level::DEBUG, ?error, "failed to start request");
            deferred.reject(error);
        }

        deferred
    }

    fn start(
        mut self,
        on_response: Box<dyn FnOnce(&ClientResponse)>,
        deferred: Deferred<ClientResponse, HttpError>,
    ) -> Result<(), HttpError> {
        let inner = self.client.inner.clone();
        event!(Level::DEBUG, method = %self.method, path = %self.path, addr = ?inner.addr, "sending request");

        let data = self.serialize(inner.addr);
        let head_request = self.method.eq_ignore_ascii_case("HEAD");

        let (stream, events) = tcp::connect(&inner.cx, inner.addr)?;
        stream.send(data)?;

        if let Some(timeout) = inner.options.idle_timeout {
            stream.set_timeout(Some(timeout))?;
        }

        let signal = Signal::default();
        events.set_signal(signal.clone());

        let mut parser = HttpParser::new(MessageKind::Response, inner.options.max_head_size);
        if head_request {
            parser.expect_bodiless_response();
        }

        let actor = Service {
            stream,
            stream_events: events,
            parser,
            head_request,

            on_response: Some(on_response),
            response: None,
            deferred,
            closing: false,
        };
        inner
            .cx
            .handle()
            .insert("http-client", &signal, actor)
            .map_err(|error| HttpError::Runtime(error.into()))?;

        Ok(())
    }

    fn serialize(&mut self, addr: SocketAddr) -> Bytes {
        let headers = &mut self.headers;

        if !headers.contains("host") {
            headers.append("Host", addr.to_string());
        }
        if !headers.contains("connection") {
            headers.append("Connection", "close");
        }

        let wants_length = !self.body.is_empty()
            || matches!(self.method.to_ascii_uppercase().as_str(), "POST" | "PUT" | "PATCH");
        if wants_length
            && !headers.contains("content-length")
            && !headers.contains("transfer-encoding")
        {
            headers.append("Content-Length", self.body.len().to_string());
        }

        let mut buffer = BytesMut::new();
        writer::write_request_head(
            &mut buffer,
            &self.method,
            &self.path,
            Version::Http11,
            headers,
        );
        buffer.put_slice(&self.body);

        buffer.freeze()
    }
}

/// A response received by the client.
///
/// Cheap to clone, every clone refers to the same response.
#[derive(Clone)]
pub struct ClientResponse {
    head: Rc<ResponseHead>,
    body: BodyStream,
}

impl ClientResponse {
    pub fn status(&self) -> u16 {
        self.head.status
    }

    pub fn reason(&self) -> &str {
        &self.head.reason
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    pub fn set_body_encoding(&self, encoding: BodyEncoding) {
        self.body.set_encoding(encoding);
    }

    pub fn on_body<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Chunk) + 'static,
    {
        self.body.on_body(listener)
    }

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

struct Service {
    stream: tcp::Stream,
    stream_events: Mailbox<tcp::StreamEvent>,
    parser: HttpParser,
    head_request: bool,

    on_response: Option<Box<dyn FnOnce(&ClientResponse)>>,
    response: Option<ClientResponse>,
    deferred: Deferred<ClientResponse, HttpError>,
    closing: bool,
}

impl Drop for Service {
    fn drop(&mut self) {
        event!(Level::DEBUG, "request closed");

        if !self.closing {
            if let Err(error) = self.stream.force_close() {
                event!(Level::DEBUG, ?error, "stream already gone");
            }
        }

        // Whatever didn't finish by now never will
        self.deferred.reject(HttpError::ConnectionClosed);
    }
}

impl Actor for Service {
    fn process(&mut self, _rt: &mut Runtime, meta: &mut Meta) -> Result<(), Error> {
        while let Some(event) = self.stream_events.recv() {
            match event {
                tcp::StreamEvent::Connected => event!(Level::DEBUG, "connected"),
                tcp::StreamEvent::Recv(event) => self.on_recv(event.data),
                tcp::StreamEvent::Eof => self.on_eof(),
                tcp::StreamEvent::Timeout => {
                    event!(Level::DEBUG, "request timed out");
                    self.fail(HttpError::Timeout, true);
                }
                tcp::StreamEvent::Closed(event) => {
                    let error = match event.error {
                        Some(error) => HttpError::Connection(error),
                        None => HttpError::ConnectionClosed,
                    };
                    self.deferred.reject(error);

                    self.closing = true;
                    meta.set_stop();
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

impl Service {
    fn on_recv(&mut self, mut data: Bytes) {
        event!(Level::TRACE, bytes = data.len(), "received data");

        while !self.closing {
            match self.parser.consume(&mut data) {
                Ok(Some(event)) => self.on_parser_event(event),
                Ok(None) => break,
                Err(error) => {
                    self.fail(error.into(), true);
                    break;
                }
            }
        }
    }

    fn on_eof(&mut self) {
        if !self.closing {
            match self.parser.finish() {
                Ok(Some(event)) => self.on_parser_event(event),
                Ok(None) => {}
                Err(error) => {
                    event!(Level::DEBUG, ?error, "response cut short");
                    self.fail(error.into(), false);
                    return;
                }
            }
        }

        if !self.closing {
            self.fail(HttpError::ConnectionClosed, false);
        }
    }

    fn on_parser_event(&mut self, event: ParserEvent) {
        match event {
            ParserEvent::Head(MessageHead::Response(head)) => {
                // Interim responses are skipped, the final one follows
                if (100..200).contains(&head.status) {
                    event!(Level::DEBUG, status = head.status, "interim response");
                    self.parser.reset();
                    if self.head_request {
                        self.parser.expect_bodiless_response();
                    }
                    return;
                }

                event!(Level::DEBUG, status = head.status, "response received");
                let response = ClientResponse {
                    head: Rc::new(head),
                    body: BodyStream::default(),
                };
                self.response = Some(response.clone());

                if let Some(on_response) = self.on_response.take() {
                    on_response(&response);
                }
            }
            ParserEvent::Head(MessageHead::Request(_)) => {
                event!(Level::WARN, "unexpected request head on client connection");
            }
            ParserEvent::Body(data) => {
                if let Some(response) = &self.response {
                    response.body.push(data);
                }
            }
            ParserEvent::Complete => self.complete(),
        }
    }

    fn complete(&mut self) {
        let Some(response) = self.response.clone() else {
            return;
        };

        self.close(false);
        response.body.complete();
        self.deferred.resolve(response);
    }

    fn fail(&mut self, error: HttpError, force: bool) {
        event!(Level::DEBUG, ?error, "request failed");

        self.close(force);
        self.deferred.reject(error);
    }

    fn close(&mut self, force: bool) {
        if self.closing {
            return;
        }
        self.closing = true;

        let result = if force {
            self.stream.force_close()
        } else {
            self.stream.close()
        };
        if result.is_err() {
            event!(Level::DEBUG, "stream already gone");
        }
    }
}
