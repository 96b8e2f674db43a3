//! Error types for Fulcrum
//!
//! All per-connection errors are non-panicking and stay inside the context
//! that produced them.

use std::io;
use thiserror::Error;

/// Core forwarding errors
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Every configured backend is dead
    #[error("no backend available")]
    NoBackendAvailable,

    /// Hard I/O failure on a client or backend socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Buffer filled up before a message boundary was seen
    #[error("buffer full after {0} bytes without a message boundary")]
    BufferFull(usize),

    /// Backend closed its side before a complete response arrived
    #[error("backend closed the connection before responding")]
    UpstreamClosed,

    /// Backend socket reported a hang-up
    #[error("backend hung up")]
    BackendHangup,

    /// A write accepted zero bytes
    #[error("write returned zero bytes")]
    WriteZero,
}

impl ProxyError {
    /// Whether the error came from backend selection rather than I/O
    pub fn is_selection_failure(&self) -> bool {
        matches!(self, ProxyError::NoBackendAvailable)
    }
}

/// Result type alias using ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;
