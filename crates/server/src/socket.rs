//! Socket configuration and the mio-backed network layer

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Registry, Token};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use fulcrum_core::{Connection, Interest, Network, SlotId};

/// Create the non-blocking listening socket
pub fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}

/// Start a non-blocking connect to a backend.
///
/// The connect is usually still in progress when this returns; completion
/// shows up as write readiness.
pub fn dial(addr: SocketAddr, recv_timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;

    let sock = SockRef::from(&stream);
    sock.set_nodelay(true)?;
    if !recv_timeout.is_zero() {
        sock.set_read_timeout(Some(recv_timeout))?;
    }

    Ok(stream)
}

fn token(slot: SlotId) -> Token {
    Token(slot.index())
}

fn interest(interest: Interest) -> mio::Interest {
    match interest {
        Interest::Readable => mio::Interest::READABLE,
        Interest::Writable => mio::Interest::WRITABLE,
    }
}

/// TCP stream handed to the engine, for clients and backends alike
#[derive(Debug)]
pub struct Stream {
    inner: TcpStream,
}

impl Stream {
    /// Wrap an accepted or dialed stream
    pub fn new(inner: TcpStream) -> Self {
        Self { inner }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Connection for Stream {
    fn poll_connected(&mut self) -> io::Result<bool> {
        if let Some(err) = self.inner.take_error()? {
            return Err(err);
        }

        match self.inner.peer_addr() {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// `Network` on top of a mio registry
#[derive(Debug)]
pub struct MioNetwork {
    registry: Registry,
    recv_timeout: Duration,
}

impl MioNetwork {
    /// Wrap a registry handle. Backend sockets get `recv_timeout` as
    /// their receive timeout.
    pub fn new(registry: Registry, recv_timeout: Duration) -> Self {
        Self {
            registry,
            recv_timeout,
        }
    }
}

impl Network for MioNetwork {
    type Conn = Stream;

    fn connect(&mut self, addr: SocketAddr) -> io::Result<Stream> {
        dial(addr, self.recv_timeout).map(Stream::new)
    }

    fn register(&mut self, conn: &mut Stream, slot: SlotId, want: Interest) -> io::Result<()> {
        self.registry
            .register(&mut conn.inner, token(slot), interest(want))
    }

    fn reregister(&mut self, conn: &mut Stream, slot: SlotId, want: Interest) -> io::Result<()> {
        self.registry
            .reregister(&mut conn.inner, token(slot), interest(want))
    }

    fn deregister(&mut self, conn: &mut Stream) -> io::Result<()> {
        self.registry.deregister(&mut conn.inner)
    }
}
