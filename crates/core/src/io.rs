//! Seams to the non-blocking socket layer
//!
//! The engine never touches OS sockets directly. The server crate implements
//! these traits on top of mio; tests use a scripted in-memory network.

use std::io;
use std::net::SocketAddr;

use crate::slots::{Interest, SlotId};

/// A non-blocking byte stream.
///
/// `read` and `write` return `io::ErrorKind::WouldBlock` when the operation
/// cannot make progress yet. Dropping the connection closes it.
pub trait Connection: io::Read + io::Write {
    /// Check the state of an outbound connect started by [`Network::connect`].
    ///
    /// Returns `Ok(true)` once established, `Ok(false)` while still in
    /// progress, and the socket error if the connect failed.
    fn poll_connected(&mut self) -> io::Result<bool>;
}

/// Socket factory plus readiness registration
pub trait Network {
    /// Connection type for both client and backend sockets
    type Conn: Connection;

    /// Start a non-blocking connect. An in-progress connect is a success.
    fn connect(&mut self, addr: SocketAddr) -> io::Result<Self::Conn>;

    /// Register a socket under a slot
    fn register(&mut self, conn: &mut Self::Conn, slot: SlotId, interest: Interest)
        -> io::Result<()>;

    /// Change the interest of a registered socket
    fn reregister(
        &mut self,
        conn: &mut Self::Conn,
        slot: SlotId,
        interest: Interest,
    ) -> io::Result<()>;

    /// Remove a socket from the poller before it is closed
    fn deregister(&mut self, conn: &mut Self::Conn) -> io::Result<()>;
}

