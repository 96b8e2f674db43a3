//! Engine tunables and message framing

use std::time::Duration;

/// Fixed response written to the client on unrecoverable failure
pub const ERROR_RESPONSE: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\
Content-Type: text/plain\r\n\
Content-Length: 25\r\n\
\r\n\
500 Internal Server Error";

/// Default maximum concurrent contexts
pub const DEFAULT_MAX_CONTEXTS: usize = 10_000;

/// Default per-context buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 65_536;

/// Default backend selections per request
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Default consecutive errors before a backend leaves rotation
pub const DEFAULT_MAX_BACKEND_ERRORS: u32 = 10;

/// Default receive timeout applied to backend sockets
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// How the end of a request or response head is detected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    /// First `\n` byte ends the message
    #[default]
    Newline,
    /// `\r\n\r\n` ends the message (end of an HTTP header block)
    HeaderBlock,
}

impl Framing {
    fn terminator(self) -> &'static [u8] {
        match self {
            Framing::Newline => b"\n",
            Framing::HeaderBlock => b"\r\n\r\n",
        }
    }

    /// Find the end of the message in `buf`, scanning only what `buf[scanned..]`
    /// could have added. Returns the index just past the terminator.
    #[inline]
    pub fn find_boundary(self, buf: &[u8], scanned: usize) -> Option<usize> {
        let terminator = self.terminator();
        let start = scanned.saturating_sub(terminator.len() - 1).min(buf.len());

        let pos = match self {
            Framing::Newline => memchr::memchr(b'\n', &buf[start..]),
            Framing::HeaderBlock => memchr::memmem::find(&buf[start..], terminator),
        }?;

        Some(start + pos + terminator.len())
    }
}

/// Capacity limits and failure policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum concurrent contexts
    pub max_contexts: usize,

    /// Buffer bytes per context
    pub buffer_size: usize,

    /// Backend selections per request before the client gets a 500
    pub max_tries: u32,

    /// Consecutive errors before a backend is removed from rotation
    pub max_backend_errors: u32,

    /// `SO_RCVTIMEO` for backend sockets
    pub recv_timeout: Duration,

    /// Cooldown before a dead backend is re-admitted (`None` = never)
    pub revive_after: Option<Duration>,

    /// Message boundary detection
    pub framing: Framing,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_contexts: DEFAULT_MAX_CONTEXTS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_tries: DEFAULT_MAX_TRIES,
            max_backend_errors: DEFAULT_MAX_BACKEND_ERRORS,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            revive_after: None,
            framing: Framing::Newline,
        }
    }
}
