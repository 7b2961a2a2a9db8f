use bytes::{Buf, Bytes, BytesMut};
use tracing::{event, Level};

use crate::{
    head::{MessageHead, RequestHead, ResponseHead, Version},
    Headers, ParseError, Uri,
};

/// Default limit for the size of a message's start line and headers.
pub const DEFAULT_MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_CHUNK_LINE: usize = 1024;

/// Direction of the messages a parser reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Waiting for the first byte of a message.
    Idle,
    StartLine,
    Headers,
    Body,
    /// The message is complete, `reset` to parse the next one.
    Complete,
    /// Malformed input was received, no further parsing is possible.
    Error,
}

pub enum ParserEvent {
    /// The start line and headers have been parsed.
    Head(MessageHead),
    /// A piece of the message body, with transfer coding removed.
    Body(Bytes),
    /// The message ended, this is only given once per message.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(u64),
    Chunked(ChunkState),
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

enum StartLine {
    Request {
        method: String,
        uri: Uri,
        version: Version,
    },
    Response {
        version: Version,
        status: u16,
        reason: String,
    },
}

/// Incremental HTTP/1.x message parser.
///
/// Bytes can be given in pieces split at any point, the parser keeps partial lines until they
/// can be completed.
pub struct HttpParser {
    kind: MessageKind,
    max_head_size: usize,
    state: ParserState,

    line: BytesMut,
    head_size: usize,
    start: Option<StartLine>,
    headers: Headers,

    framing: Framing,
    bodiless: bool,
}

impl HttpParser {
    pub fn new(kind: MessageKind, max_head_size: usize) -> Self {
        Self {
            kind,
            max_head_size,
            state: ParserState::Idle,

            line: BytesMut::new(),
            head_size: 0,
            start: None,
            headers: Headers::new(),

            framing: Framing::Length(0),
            bodiless: false,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// The next response has no body regardless of its headers, as it answers a HEAD request.
    pub fn expect_bodiless_response(&mut self) {
        self.bodiless = true;
    }

    /// Consume bytes into the parser.
    ///
    /// Suspends and returns if new parsed data is available, trimming `bytes` of the consumed
    /// data. Returns `None` when more bytes are needed, or when the message is complete.
    pub fn consume(&mut self, bytes: &mut Bytes) -> Result<Option<ParserEvent>, ParseError> {
        let result = self.consume_inner(bytes);

        if let Err(error) = &result {
            event!(Level::DEBUG, ?error, "malformed message");
            self.state = ParserState::Error;
        }

        result
    }

    /// Signal the end of the stream.
    ///
    /// Completes messages framed by the connection closing, and fails messages that were only
    /// partially received.
    pub fn finish(&mut self) -> Result<Option<ParserEvent>, ParseError> {
        match self.state {
            ParserState::Idle | ParserState::Complete => Ok(None),
            ParserState::Error => Err(ParseError::Failed),
            ParserState::Body if self.framing == Framing::UntilClose => Ok(Some(self.complete())),
            _ => {
                self.state = ParserState::Error;
                Err(ParseError::UnexpectedEof)
            }
        }
    }

    /// Clear all message state, to start parsing the next message.
    pub fn reset(&mut self) {
        self.state = ParserState::Idle;
        self.line.clear();
        self.head_size = 0;
        self.start = None;
        self.headers = Headers::new();
        self.framing = Framing::Length(0);
        self.bodiless = false;
    }

    fn consume_inner(&mut self, bytes: &mut Bytes) -> Result<Option<ParserEvent>, ParseError> {
        loop {
            match self.state {
                ParserState::Error => return Err(ParseError::Failed),
                ParserState::Complete => return Ok(None),
                ParserState::Idle | ParserState::StartLine => {
                    let Some(line) = self.take_head_line(bytes)? else {
                        if !self.line.is_empty() {
                            self.state = ParserState::StartLine;
                        }
                        return Ok(None);
                    };

                    // Empty lines before the start line are skipped
                    if line.is_empty() {
                        continue;
                    }

                    self.start = Some(parse_start_line(self.kind, &line)?);
                    self.state = ParserState::Headers;
                }
                ParserState::Headers => {
                    let Some(line) = self.take_head_line(bytes)? else {
                        return Ok(None);
                    };

                    // Empty line signals end of the header
                    if line.is_empty() {
                        let head = self.finish_head()?;
                        return Ok(Some(ParserEvent::Head(head)));
                    }

                    let (name, value) = parse_field(&line)?;
                    self.headers.append(name, value);
                }
                ParserState::Body => return self.consume_body(bytes),
            }
        }
    }

    fn finish_head(&mut self) -> Result<MessageHead, ParseError> {
        let start = self.start.take().ok_or(ParseError::InvalidStartLine)?;
        let headers = std::mem::take(&mut self.headers);

        let head = match start {
            StartLine::Request {
                method,
                uri,
                version,
            } => MessageHead::Request(RequestHead {
                method,
                uri,
                version,
                headers,
            }),
            StartLine::Response {
                version,
                status,
                reason,
            } => MessageHead::Response(ResponseHead {
                version,
                status,
                reason,
                headers,
            }),
        };

        self.framing = framing(&head, self.bodiless)?;
        event!(Level::TRACE, framing = ?self.framing, "parsed message head");
        self.state = ParserState::Body;

        Ok(head)
    }

    fn consume_body(&mut self, bytes: &mut Bytes) -> Result<Option<ParserEvent>, ParseError> {
        loop {
            match self.framing {
                Framing::Length(0) => return Ok(Some(self.complete())),
                Framing::Length(remaining) => {
                    if bytes.is_empty() {
                        return Ok(None);
                    }

                    let len = clamp(remaining, bytes.len());
                    self.framing = Framing::Length(remaining - len as u64);
                    return Ok(Some(ParserEvent::Body(bytes.split_to(len))));
                }
                Framing::UntilClose => {
                    if bytes.is_empty() {
                        return Ok(None);
                    }

                    return Ok(Some(ParserEvent::Body(std::mem::take(bytes))));
                }
                Framing::Chunked(ChunkState::Size) => {
                    let Some(line) = self.take_line(bytes).0 else {
                        if self.line.len() > MAX_CHUNK_LINE {
                            return Err(ParseError::InvalidChunk);
                        }
                        return Ok(None);
                    };

                    let size = parse_chunk_size(&line)?;
                    let next = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                    self.framing = Framing::Chunked(next);
                }
                Framing::Chunked(ChunkState::Data(remaining)) => {
                    if bytes.is_empty() {
                        return Ok(None);
                    }

                    let len = clamp(remaining, bytes.len());
                    let left = remaining - len as u64;
                    let next = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                    self.framing = Framing::Chunked(next);

                    return Ok(Some(ParserEvent::Body(bytes.split_to(len))));
                }
                Framing::Chunked(ChunkState::DataEnd) => {
                    let Some(line) = self.take_line(bytes).0 else {
                        if self.line.iter().any(|byte| *byte != b'\r') {
                            return Err(ParseError::InvalidChunk);
                        }
                        return Ok(None);
                    };

                    if !line.is_empty() {
                        return Err(ParseError::InvalidChunk);
                    }
                    self.framing = Framing::Chunked(ChunkState::Size);
                }
                Framing::Chunked(ChunkState::Trailer) => {
                    // Trailer fields are skipped, but still count towards the head limit
                    let Some(line) = self.take_head_line(bytes)? else {
                        return Ok(None);
                    };

                    if line.is_empty() {
                        return Ok(Some(self.complete()));
                    }
                }
            }
        }
    }

    fn complete(&mut self) -> ParserEvent {
        self.state = ParserState::Complete;
        ParserEvent::Complete
    }

    fn take_head_line(&mut self, bytes: &mut Bytes) -> Result<Option<Bytes>, ParseError> {
        let (line, consumed) = self.take_line(bytes);

        self.head_size += consumed;
        if self.head_size > self.max_head_size {
            return Err(ParseError::HeadTooLarge(self.max_head_size));
        }

        Ok(line)
    }

    /// Take the next full line, without terminator, accumulating partial lines.
    ///
    /// CRLF is the required newline, but a bare LF is accepted the same.
    fn take_line(&mut self, bytes: &mut Bytes) -> (Option<Bytes>, usize) {
        let Some(index) = bytes.iter().position(|byte| *byte == b'\n') else {
            let consumed = bytes.len();
            self.line.extend_from_slice(bytes);
            bytes.advance(consumed);
            return (None, consumed);
        };

        self.line.extend_from_slice(&bytes[..index]);
        bytes.advance(index + 1);

        let mut line = self.line.split().freeze();
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        (Some(line), index + 1)
    }
}

fn clamp(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |remaining| remaining.min(available))
}

fn framing(head: &MessageHead, bodiless: bool) -> Result<Framing, ParseError> {
    if let MessageHead::Response(response) = head {
        let status = response.status;
        if bodiless || (100..200).contains(&status) || status == 204 || status == 304 {
            return Ok(Framing::Length(0));
        }
    }

    let headers = head.headers();
    let is_request = matches!(head, MessageHead::Request(_));

    // Transfer-Encoding takes precedence over Content-Length
    let last_coding = headers
        .get_all("transfer-encoding")
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .last();
    if let Some(coding) = last_coding {
        if coding.eq_ignore_ascii_case("chunked") {
            return Ok(Framing::Chunked(ChunkState::Size));
        }

        // A request body without a known end can't be framed
        if is_request {
            return Err(ParseError::InvalidTransferEncoding);
        }
        return Ok(Framing::UntilClose);
    }

    let mut length = None;
    for value in headers.get_all("content-length") {
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|byte| byte.is_ascii_digit()) {
                return Err(ParseError::InvalidContentLength);
            }

            let parsed: u64 = part
                .parse()
                .map_err(|_| ParseError::InvalidContentLength)?;
            if length.is_some_and(|length| length != parsed) {
                return Err(ParseError::InvalidContentLength);
            }
            length = Some(parsed);
        }
    }

    let framing = match length {
        Some(length) => Framing::Length(length),
        None if is_request => Framing::Length(0),
        None => Framing::UntilClose,
    };
    Ok(framing)
}

fn parse_start_line(kind: MessageKind, line: &[u8]) -> Result<StartLine, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidStartLine)?;

    match kind {
        MessageKind::Request => {
            let mut parts = line.split(' ');
            let (Some(method), Some(target), Some(version), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(ParseError::InvalidStartLine);
            };

            if method.is_empty() || !method.bytes().all(is_token) || target.is_empty() {
                return Err(ParseError::InvalidStartLine);
            }

            Ok(StartLine::Request {
                method: method.to_string(),
                uri: Uri::parse(target),
                version: parse_version(version)?,
            })
        }
        MessageKind::Response => {
            let (version, rest) = line.split_once(' ').ok_or(ParseError::InvalidStartLine)?;
            let version = parse_version(version)?;

            let (status, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            if status.len() != 3 || !status.bytes().all(|byte| byte.is_ascii_digit()) {
                return Err(ParseError::InvalidStatus);
            }
            let status: u16 = status.parse().map_err(|_| ParseError::InvalidStatus)?;
            if status < 100 {
                return Err(ParseError::InvalidStatus);
            }

            Ok(StartLine::Response {
                version,
                status,
                reason: reason.to_string(),
            })
        }
    }
}

fn parse_version(value: &str) -> Result<Version, ParseError> {
    Version::parse(value).ok_or_else(|| {
        if value.starts_with("HTTP/") {
            ParseError::UnsupportedVersion
        } else {
            ParseError::InvalidStartLine
        }
    })
}

fn parse_field(line: &[u8]) -> Result<(String, String), ParseError> {
    // Obsolete line folding is rejected
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(ParseError::InvalidHeader);
    }

    let split = line
        .iter()
        .position(|byte| *byte == b':')
        .ok_or(ParseError::InvalidHeader)?;

    let name = trim(&line[..split]);
    if name.is_empty() || !name.iter().copied().all(is_token) {
        return Err(ParseError::InvalidHeader);
    }
    let name = std::str::from_utf8(name).map_err(|_| ParseError::InvalidHeader)?;

    let value = trim(&line[split + 1..]);
    let value = String::from_utf8_lossy(value);

    Ok((name.to_string(), value.into_owned()))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    // Extensions are ignored
    let size = match line.iter().position(|byte| *byte == b';') {
        Some(index) => &line[..index],
        None => line,
    };
    let size = std::str::from_utf8(size)
        .map_err(|_| ParseError::InvalidChunk)?
        .trim();

    if size.is_empty() || size.len() > 16 {
        return Err(ParseError::InvalidChunk);
    }

    u64::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunk)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(start, |index| index + 1);

    &bytes[start..end]
}

fn is_token(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}
