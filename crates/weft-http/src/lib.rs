//! HTTP/1.1 server and client, on top of the weft-mio event loop.
//!
//! Messages are parsed incrementally as bytes arrive. Requests and responses hand out their
//! body as "body" events, followed by a single "complete" event.

mod body;
mod client;
mod connection;
mod error;
mod head;
mod headers;
mod options;
pub mod parser;
mod server;
mod uri;
pub mod writer;

pub use self::{
    body::{BodyEncoding, Chunk, MessageEvent},
    client::{create_client, Client, ClientRequest, ClientResponse},
    connection::{Request, Response},
    error::{HttpError, ParseError},
    head::{MessageHead, RequestHead, ResponseHead, Version},
    headers::Headers,
    options::{ClientOptions, ServerOptions},
    server::{create_server, Server, ServerEvent},
    uri::Uri,
};
