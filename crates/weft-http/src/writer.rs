//! HTTP/1.x message serialization.

use bytes::{BufMut, BytesMut};

use crate::{head::Version, Headers};

/// Write a request start line and headers, followed by the blank line.
pub fn write_request_head(
    buffer: &mut BytesMut,
    method: &str,
    target: &str,
    version: Version,
    headers: &Headers,
) {
    buffer.put_slice(method.as_bytes());
    buffer.put_u8(b' ');
    buffer.put_slice(target.as_bytes());
    buffer.put_u8(b' ');
    buffer.put_slice(version.as_str().as_bytes());
    buffer.put_slice(b"\r\n");

    write_fields(buffer, headers);
}

/// Write a response status line and headers, followed by the blank line.
pub fn write_response_head(
    buffer: &mut BytesMut,
    version: Version,
    status: u16,
    reason: &str,
    headers: &Headers,
) {
    buffer.put_slice(version.as_str().as_bytes());
    buffer.put_u8(b' ');
    buffer.put_slice(status.to_string().as_bytes());
    buffer.put_u8(b' ');
    buffer.put_slice(reason.as_bytes());
    buffer.put_slice(b"\r\n");

    write_fields(buffer, headers);
}

fn write_fields(buffer: &mut BytesMut, headers: &Headers) {
    for (name, value) in headers.iter() {
        buffer.put_slice(name.as_bytes());
        buffer.put_slice(b": ");
        buffer.put_slice(value.as_bytes());
        buffer.put_slice(b"\r\n");
    }

    // Header/body separator
    buffer.put_slice(b"\r\n");
}

/// Write one chunk of a chunked body.
///
/// Empty data writes nothing, as an empty chunk would end the body.
pub fn write_chunk(buffer: &mut BytesMut, data: &[u8]) {
    if data.is_empty() {
        return;
    }

    buffer.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buffer.put_slice(data);
    buffer.put_slice(b"\r\n");
}

/// Write the chunk ending a chunked body, without trailers.
pub fn write_last_chunk(buffer: &mut BytesMut) {
    buffer.put_slice(b"0\r\n\r\n");
}

/// Standard reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
