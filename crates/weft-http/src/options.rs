use std::time::Duration;

use crate::parser::DEFAULT_MAX_HEAD_SIZE;

/// Configuration of an HTTP server.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ServerOptions {
    /// Limit for the size of a request's start line and headers.
    pub max_head_size: usize,
    /// Close connections that see no traffic for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
            idle_timeout: None,
        }
    }
}

impl ServerOptions {
    pub fn with_max_head_size(mut self, value: usize) -> Self {
        self.max_head_size = value;
        self
    }

    pub fn with_idle_timeout(mut self, value: Option<Duration>) -> Self {
        self.idle_timeout = value;
        self
    }
}

/// Configuration of an HTTP client.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientOptions {
    /// Limit for the size of a response's status line and headers.
    pub max_head_size: usize,
    /// Fail an exchange that sees no traffic for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
            idle_timeout: None,
        }
    }
}

impl ClientOptions {
    pub fn with_max_head_size(mut self, value: usize) -> Self {
        self.max_head_size = value;
        self
    }

    pub fn with_idle_timeout(mut self, value: Option<Duration>) -> Self {
        self.idle_timeout = value;
        self
    }
}
