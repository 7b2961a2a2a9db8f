use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use bytes::Bytes;
use tracing::{event, Level};
use weft::{Event, EventEmitter, Subscription};

/// How body chunks are decoded before they're given to "body" listeners.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    /// Raw bytes.
    #[default]
    Binary,
    /// Text, with the high bit of every byte stripped.
    Ascii,
    /// Text, with multi-byte sequences split across chunks joined back together.
    Utf8,
}

/// A decoded piece of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Binary(Bytes),
    Text(String),
}

impl Chunk {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Chunk::Binary(data) => data,
            Chunk::Text(text) => text.as_bytes(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Chunk::Binary(_) => None,
            Chunk::Text(text) => Some(text),
        }
    }
}

/// Events of an incoming message body.
pub enum MessageEvent {
    Body(Chunk),
    Complete,
}

impl Event for MessageEvent {
    fn name(&self) -> &'static str {
        match self {
            MessageEvent::Body(_) => "body",
            MessageEvent::Complete => "complete",
        }
    }
}

/// Body of an incoming message, delivering chunks and completion to listeners.
///
/// Chunks received while nobody listens for "body" are kept, and given to the first body
/// listener when it's registered. "complete" is held back until those chunks are delivered.
#[derive(Clone, Default)]
pub(crate) struct BodyStream {
    inner: Rc<RefCell<BodyInner>>,
    events: EventEmitter<MessageEvent>,
}

#[derive(Default)]
struct BodyInner {
    encoding: BodyEncoding,
    pending: VecDeque<Bytes>,
    carry: Vec<u8>,
    /// No more data will be pushed.
    ended: bool,
    /// "complete" was emitted.
    complete: bool,
}

impl BodyStream {
    pub fn events(&self) -> &EventEmitter<MessageEvent> {
        &self.events
    }

    pub fn encoding(&self) -> BodyEncoding {
        self.inner.borrow().encoding
    }

    /// Change the decoding of chunks not yet delivered.
    pub fn set_encoding(&self, encoding: BodyEncoding) {
        self.inner.borrow_mut().encoding = encoding;
    }

    pub fn is_complete(&self) -> bool {
        self.inner.borrow().complete
    }

    pub fn on_body<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Chunk) + 'static,
    {
        let subscription = self.events.on("body", move |event| {
            if let MessageEvent::Body(chunk) = event {
                listener(chunk);
            }
        });

        // Deliver what arrived before anyone listened
        let pending: Vec<_> = self.inner.borrow_mut().pending.drain(..).collect();
        for data in pending {
            self.deliver(data);
        }

        let held = {
            let inner = self.inner.borrow();
            inner.ended && !inner.complete
        };
        if held {
            self.finish();
        }

        subscription
    }

    /// Register a "complete" listener, called immediately if the body is already complete.
    pub fn on_complete<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + 'static,
    {
        let listener = Rc::new(listener);

        let subscription = {
            let listener = listener.clone();
            self.events.on("complete", move |_| listener())
        };

        if self.is_complete() {
            listener();
        }

        subscription
    }

    pub fn push(&self, data: Bytes) {
        if self.inner.borrow().ended {
            event!(Level::WARN, len = data.len(), "body already ended, dropping chunk");
            return;
        }

        if self.events.listener_count("body") == 0 {
            event!(Level::TRACE, len = data.len(), "no body listener, keeping chunk");
            self.inner.borrow_mut().pending.push_back(data);
            return;
        }

        self.deliver(data);
    }

    pub fn complete(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.ended {
                return;
            }
            inner.ended = true;

            if !inner.pending.is_empty() {
                event!(Level::TRACE, "body not read yet, holding completion");
                return;
            }
        }

        self.finish();
    }

    fn finish(&self) {
        let rest = {
            let mut inner = self.inner.borrow_mut();
            inner.complete = true;

            // Left over partial text is flushed as-is
            std::mem::take(&mut inner.carry)
        };

        if !rest.is_empty() {
            let text = String::from_utf8_lossy(&rest).into_owned();
            self.events.emit(&MessageEvent::Body(Chunk::Text(text)));
        }

        self.events.emit(&MessageEvent::Complete);
    }

    fn deliver(&self, data: Bytes) {
        let chunk = self.inner.borrow_mut().decode(data);

        if let Some(chunk) = chunk {
            self.events.emit(&MessageEvent::Body(chunk));
        }
    }
}

impl BodyInner {
    fn decode(&mut self, data: Bytes) -> Option<Chunk> {
        match self.encoding {
            BodyEncoding::Binary => Some(Chunk::Binary(self.join_carry(data))),
            BodyEncoding::Ascii => {
                let data = self.join_carry(data);
                let text = data.iter().map(|byte| (byte & 0x7f) as char).collect();
                Some(Chunk::Text(text))
            }
            BodyEncoding::Utf8 => {
                let mut bytes = std::mem::take(&mut self.carry);
                bytes.extend_from_slice(&data);

                // Keep an incomplete trailing sequence for the next chunk
                let split = incomplete_tail(&bytes);
                self.carry = bytes.split_off(split);

                if bytes.is_empty() {
                    return None;
                }

                let text = String::from_utf8_lossy(&bytes).into_owned();
                Some(Chunk::Text(text))
            }
        }
    }

    /// Prepend bytes held back from an earlier utf-8 chunk.
    fn join_carry(&mut self, data: Bytes) -> Bytes {
        if self.carry.is_empty() {
            return data;
        }

        let mut joined = std::mem::take(&mut self.carry);
        joined.extend_from_slice(&data);
        Bytes::from(joined)
    }
}

/// Index where an incomplete UTF-8 sequence at the end of `bytes` starts.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();

    for back in 1..=len.min(3) {
        let byte = bytes[len - back];

        // Continuation byte, the lead byte is further back
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }

        let needed = match byte {
            0xF0.. => 4,
            0xE0.. => 3,
            0xC0.. => 2,
            _ => 1,
        };

        return if needed > back { len - back } else { len };
    }

    len
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn collect(body: &BodyStream) -> Rc<RefCell<Vec<Chunk>>> {
        let chunks = Rc::new(RefCell::new(Vec::new()));
        {
            let chunks = chunks.clone();
            body.on_body(move |chunk| chunks.borrow_mut().push(chunk.clone()));
        }
        chunks
    }

    #[test]
    fn utf8_rejoins_split_sequences() {
        let body = BodyStream::default();
        body.set_encoding(BodyEncoding::Utf8);
        let chunks = collect(&body);

        let text = "héllo wörld €".as_bytes();
        for piece in text.chunks(1) {
            body.push(Bytes::copy_from_slice(piece));
        }
        body.complete();

        let joined: String = chunks
            .borrow()
            .iter()
            .filter_map(|chunk| chunk.as_text().map(str::to_string))
            .collect();
        assert_eq!(joined, "héllo wörld €");
    }

    #[test]
    fn ascii_strips_high_bit() {
        let body = BodyStream::default();
        body.set_encoding(BodyEncoding::Ascii);
        let chunks = collect(&body);

        body.push(Bytes::from_static(&[b'h', b'i' | 0x80]));

        assert_eq!(*chunks.borrow(), [Chunk::Text("hi".to_string())]);
    }

    #[test]
    fn chunks_kept_until_listener() {
        let body = BodyStream::default();
        body.push(Bytes::from_static(b"early"));

        // Encoding changes apply to chunks not delivered yet
        body.set_encoding(BodyEncoding::Utf8);
        let chunks = collect(&body);
        body.push(Bytes::from_static(b" late"));

        assert_eq!(
            *chunks.borrow(),
            [
                Chunk::Text("early".to_string()),
                Chunk::Text(" late".to_string())
            ]
        );
    }

    #[test]
    fn complete_fires_once_and_late_listener_fires_immediately() {
        let body = BodyStream::default();
        let count = Rc::new(RefCell::new(0));

        {
            let count = count.clone();
            body.on_complete(move || *count.borrow_mut() += 1);
        }
        body.complete();
        body.complete();
        assert_eq!(*count.borrow(), 1);

        {
            let count = count.clone();
            body.on_complete(move || *count.borrow_mut() += 10);
        }
        assert_eq!(*count.borrow(), 11);
    }

    #[test]
    fn complete_waits_for_kept_chunks() {
        let body = BodyStream::default();
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let log = log.clone();
            body.on_complete(move || log.borrow_mut().push("complete".to_string()));
        }
        body.push(Bytes::from_static(b"abc"));
        body.complete();
        assert!(!body.is_complete());
        assert!(log.borrow().is_empty());

        {
            let log = log.clone();
            body.on_body(move |chunk| log.borrow_mut().push(format!("body {:?}", chunk)));
        }

        assert!(body.is_complete());
        assert_eq!(
            *log.borrow(),
            ["body Binary(b\"abc\")".to_string(), "complete".to_string()]
        );
    }

    #[test]
    fn switching_from_utf8_keeps_byte_order() {
        let body = BodyStream::default();
        body.set_encoding(BodyEncoding::Utf8);
        let chunks = collect(&body);

        body.push(Bytes::from_static(b"a\xc3"));
        body.set_encoding(BodyEncoding::Ascii);
        body.push(Bytes::from_static(b"\xa9b"));
        body.complete();

        // The held back lead byte comes first, with its high bit stripped
        assert_eq!(
            *chunks.borrow(),
            [Chunk::Text("a".to_string()), Chunk::Text("C)b".to_string())]
        );
    }

    #[test]
    fn incomplete_tail_positions() {
        assert_eq!(incomplete_tail(b"abc"), 3);
        assert_eq!(incomplete_tail(&[b'a', 0xE2, 0x82]), 1);
        assert_eq!(incomplete_tail(&[0xE2, 0x82, 0xAC]), 3);
        assert_eq!(incomplete_tail(&[b'a', 0xC3]), 1);
    }
}
