//! Non-blocking network sockets as actors.

pub mod tcp;

use std::io::{self, ErrorKind};

use thiserror::Error;
use weft::{RuntimeError, SendError};

fn check_io<T>(value: Result<T, io::Error>) -> Result<Option<T>, io::Error> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            // WouldBlock just means we've run out of things to handle
            if error.kind() == ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(error)
            }
        }
    }
}

/// Failed to open a socket.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("socket i/o failed")]
    Io(#[from] io::Error),
    #[error("failed to start socket actor")]
    Runtime(#[from] RuntimeError),
    #[error("failed to queue socket event")]
    Send(#[from] SendError),
    #[error("stream is closed")]
    Closed,
}

impl NetError {
    /// The I/O error kind, if this was an I/O failure.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            NetError::Io(error) => Some(error.kind()),
            _ => None,
        }
    }
}
