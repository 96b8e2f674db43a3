//! Scripted in-memory network for driving the balancer in tests

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::engine::Balancer;
use crate::io::{Connection, Network};
use crate::slots::{Interest, Readiness, SlotId};

#[derive(Debug, Default)]
struct Pipe {
    inbound: VecDeque<u8>,
    eof: bool,
    written: Vec<u8>,
    write_limit: Option<usize>,
    write_blocked: bool,
    write_error: Option<io::ErrorKind>,
    read_error: Option<io::ErrorKind>,
    connect_error: Option<io::ErrorKind>,
    connecting: bool,
    registration: Option<(SlotId, Interest)>,
}

/// One end of a scripted connection. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MockConn {
    pipe: Rc<RefCell<Pipe>>,
}

impl MockConn {
    /// Queue bytes for the engine to read
    pub fn push(&self, bytes: &[u8]) {
        self.pipe.borrow_mut().inbound.extend(bytes);
    }

    /// Signal EOF once queued bytes are drained
    pub fn close(&self) {
        self.pipe.borrow_mut().eof = true;
    }

    /// Everything the engine wrote
    pub fn written(&self) -> Vec<u8> {
        self.pipe.borrow().written.clone()
    }

    /// Cap the bytes accepted per write call
    pub fn set_write_limit(&self, limit: usize) {
        self.pipe.borrow_mut().write_limit = Some(limit);
    }

    /// Make writes return would-block
    pub fn block_writes(&self, blocked: bool) {
        self.pipe.borrow_mut().write_blocked = blocked;
    }

    /// Make every write fail
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.pipe.borrow_mut().write_error = Some(kind);
    }

    /// Make every read fail
    pub fn fail_reads(&self, kind: io::ErrorKind) {
        self.pipe.borrow_mut().read_error = Some(kind);
    }

    /// Finish a pending connect
    pub fn finish_connect(&self) {
        self.pipe.borrow_mut().connecting = false;
    }

    /// Current poller registration
    pub fn registration(&self) -> Option<(SlotId, Interest)> {
        self.pipe.borrow().registration
    }
}

impl io::Read for MockConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.borrow_mut();
        if let Some(kind) = pipe.read_error {
            return Err(kind.into());
        }
        if pipe.inbound.is_empty() {
            return if pipe.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }

        let n = buf.len().min(pipe.inbound.len());
        for (dst, src) in buf.iter_mut().zip(pipe.inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl io::Write for MockConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.borrow_mut();
        if let Some(kind) = pipe.write_error {
            return Err(kind.into());
        }
        if pipe.write_blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = pipe.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        pipe.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for MockConn {
    fn poll_connected(&mut self) -> io::Result<bool> {
        let pipe = self.pipe.borrow();
        if let Some(kind) = pipe.connect_error {
            return Err(kind.into());
        }
        Ok(!pipe.connecting)
    }
}

#[derive(Debug, Default)]
struct NetState {
    refused: HashSet<SocketAddr>,
    failing: HashSet<SocketAddr>,
    slow: HashSet<SocketAddr>,
    dialed: Vec<(SocketAddr, MockConn)>,
    conns: Vec<MockConn>,
}

/// Network handle. Clones share the same state, so a test keeps one clone
/// while the balancer owns another.
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    state: Rc<RefCell<NetState>>,
}

impl MockNetwork {
    /// Create a client connection to hand to `Balancer::admit`
    pub fn client(&self) -> MockConn {
        let conn = MockConn::default();
        self.state.borrow_mut().conns.push(conn.clone());
        conn
    }

    /// `connect` to this address fails immediately
    pub fn refuse(&self, addr: SocketAddr) {
        self.state.borrow_mut().refused.insert(addr);
    }

    /// `connect` to this address starts, then fails asynchronously
    pub fn fail_async(&self, addr: SocketAddr) {
        self.state.borrow_mut().failing.insert(addr);
    }

    /// `connect` to this address stays in progress until finished by hand
    pub fn slow(&self, addr: SocketAddr) {
        self.state.borrow_mut().slow.insert(addr);
    }

    /// Every connect attempt in order, including refused ones
    pub fn dialed(&self) -> Vec<(SocketAddr, MockConn)> {
        self.state.borrow().dialed.clone()
    }

    /// Most recent backend connection
    pub fn last_backend(&self) -> MockConn {
        self.state
            .borrow()
            .dialed
            .last()
            .map(|(_, conn)| conn.clone())
            .expect("no backend dialed")
    }

    /// Connections currently registered with the poller
    pub fn registered(&self) -> usize {
        self.state
            .borrow()
            .conns
            .iter()
            .filter(|c| c.registration().is_some())
            .count()
    }
}

impl Network for MockNetwork {
    type Conn = MockConn;

    fn connect(&mut self, addr: SocketAddr) -> io::Result<MockConn> {
        let mut state = self.state.borrow_mut();
        let conn = MockConn::default();
        state.dialed.push((addr, conn.clone()));

        if state.refused.contains(&addr) {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }

        {
            let mut pipe = conn.pipe.borrow_mut();
            if state.failing.contains(&addr) {
                pipe.connect_error = Some(io::ErrorKind::ConnectionRefused);
            }
            pipe.connecting = state.slow.contains(&addr);
        }

        state.conns.push(conn.clone());
        Ok(conn)
    }

    fn register(
        &mut self,
        conn: &mut MockConn,
        slot: SlotId,
        interest: Interest,
    ) -> io::Result<()> {
        conn.pipe.borrow_mut().registration = Some((slot, interest));
        Ok(())
    }

    fn reregister(
        &mut self,
        conn: &mut MockConn,
        slot: SlotId,
        interest: Interest,
    ) -> io::Result<()> {
        conn.pipe.borrow_mut().registration = Some((slot, interest));
        Ok(())
    }

    fn deregister(&mut self, conn: &mut MockConn) -> io::Result<()> {
        conn.pipe.borrow_mut().registration = None;
        Ok(())
    }
}

/// Report every leased socket as readable and writable, then run one pass.
/// Mock sockets return would-block when they cannot progress, which makes
/// this equivalent to a level-triggered poller.
pub fn pump(balancer: &mut Balancer<MockNetwork>) -> usize {
    let slots: Vec<SlotId> = balancer
        .pool()
        .iter()
        .flat_map(|c| std::iter::once(c.client_slot()).chain(c.backend_slot()))
        .collect();

    for slot in slots {
        balancer.notify(slot, Readiness::both());
    }
    balancer.dispatch()
}

/// Pump until no context is left or the pass limit is hit
pub fn pump_until_idle(balancer: &mut Balancer<MockNetwork>, max_passes: usize) -> usize {
    let mut passes = 0;
    while balancer.pool().in_use() > 0 && passes < max_passes {
        pump(balancer);
        passes += 1;
    }
    passes
}
