//! TCP listeners and streams.

mod listener;
mod stream;

pub use self::{
    listener::{listen, ConnectedEvent, Listener, ListenerEvent},
    stream::{connect, ClosedEvent, ReadyState, RecvEvent, Stream, StreamAction, StreamEvent},
};
