use std::{io, net::SocketAddr};

use thiserror::Error;
use weft_mio::net::NetError;

/// Malformed HTTP message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid start line")]
    InvalidStartLine,
    #[error("unsupported http version")]
    UnsupportedVersion,
    #[error("invalid status code")]
    InvalidStatus,
    #[error("invalid header line")]
    InvalidHeader,
    #[error("invalid or conflicting content length")]
    InvalidContentLength,
    #[error("unsupported transfer encoding")]
    InvalidTransferEncoding,
    #[error("invalid chunk framing")]
    InvalidChunk,
    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("stream ended before the message was complete")]
    UnexpectedEof,
    #[error("parser is in error state")]
    Failed,
}

/// Failure of an HTTP server, client or exchange.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("failed to parse message")]
    Parse(#[from] ParseError),
    #[error("connection failed")]
    Connection(#[source] io::Error),
    #[error("connection closed before the exchange completed")]
    ConnectionClosed,
    #[error("connection timed out")]
    Timeout,
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),
    #[error("i/o error")]
    Io(#[from] io::Error),
    #[error("connection is closed")]
    Closed,
    #[error("headers have already been sent")]
    HeadersAlreadySent,
    #[error("headers have not been sent yet")]
    HeadersNotSent,
    #[error("message has already been finished")]
    AlreadyFinished,
    #[error("server is already listening")]
    AlreadyListening,
    #[error("runtime failure")]
    Runtime(#[source] anyhow::Error),
}

impl From<NetError> for HttpError {
    fn from(error: NetError) -> Self {
        match error {
            NetError::Io(error) => HttpError::Io(error),
            NetError::Closed => HttpError::Closed,
            other => HttpError::Runtime(other.into()),
        }
    }
}
