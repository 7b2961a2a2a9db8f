use std::fmt;

use crate::{Headers, Uri};

/// HTTP protocol version of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub uri: Uri,
    pub version: Version,
    pub headers: Headers,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

#[derive(Debug, Clone)]
pub enum MessageHead {
    Request(RequestHead),
    Response(ResponseHead),
}

impl MessageHead {
    pub fn version(&self) -> Version {
        match self {
            MessageHead::Request(head) => head.version,
            MessageHead::Response(head) => head.version,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            MessageHead::Request(head) => &head.headers,
            MessageHead::Response(head) => &head.headers,
        }
    }
}

/// Returns true if a connection persists after a message with this version and headers.
pub(crate) fn keep_alive(version: Version, headers: &Headers) -> bool {
    match version {
        Version::Http11 => !headers.has_token("connection", "close"),
        Version::Http10 => headers.has_token("connection", "keep-alive"),
    }
}
