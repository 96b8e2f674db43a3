//! Per-connection state machine
//!
//! `step` performs at most one data transfer for a context and returns.
//! Would-block results clear the readiness bit they were waiting on; any hard
//! error is handed to the retry handler.

use std::io::{self, Read, Write};

use crate::engine::Balancer;
use crate::error::{ProxyError, Result};
use crate::io::{Connection, Network};
use crate::limits::ERROR_RESPONSE;
use crate::pool::{ContextId, State};
use crate::slots::{Interest, SlotId, SlotTable};

/// Outcome of a single non-blocking read or write
enum Transfer {
    Bytes(usize),
    WouldBlock,
    Interrupted,
}

fn transfer(res: io::Result<usize>) -> Result<Transfer> {
    match res {
        Ok(n) => Ok(Transfer::Bytes(n)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(Transfer::Interrupted),
        Err(err) => Err(err.into()),
    }
}

impl<N: Network> Balancer<N> {
    /// Advance one context by one step
    pub(crate) fn step(&mut self, id: ContextId) {
        let Some(state) = self.pool.get(id).map(|c| c.state) else {
            return;
        };

        let result = match state {
            State::ReceivingRequest => self.receive_request(id),
            State::SendingRequest => self.send_request(id),
            State::ReceivingResponse => self.receive_response(id),
            State::SendingResponse => self.send_response(id),
            State::Error => self.send_error(id),
            State::Done => Ok(()),
        };

        if let Err(err) = result {
            self.fail(id, err);
        }
    }

    fn receive_request(&mut self, id: ContextId) -> Result<()> {
        let framing = self.limits.framing;
        let Some(ctx) = self.pool.get_mut(id) else {
            return Ok(());
        };

        let scanned = ctx.len;
        if scanned == ctx.buffer.len() {
            return Err(ProxyError::BufferFull(scanned));
        }

        let n = match transfer(ctx.client.read(&mut ctx.buffer[scanned..]))? {
            Transfer::Bytes(0) => {
                tracing::debug!(
                    context = id.index(),
                    buffered = scanned,
                    "client closed before request completed"
                );
                ctx.state = State::Done;
                return Ok(());
            }
            Transfer::Bytes(n) => n,
            Transfer::WouldBlock => {
                self.slots.consume(ctx.client_slot, Interest::Readable);
                return Ok(());
            }
            Transfer::Interrupted => return Ok(()),
        };

        ctx.len += n;
        tracing::trace!(context = id.index(), bytes = n, buffered = ctx.len, "request read");

        let Some(end) = framing.find_boundary(&ctx.buffer[..ctx.len], scanned) else {
            if ctx.len == ctx.buffer.len() {
                return Err(ProxyError::BufferFull(ctx.len));
            }
            return Ok(());
        };

        let backend = self.policy.select(&self.backends)?;

        ctx.backend_idx = Some(backend);
        ctx.tries = 1;
        ctx.cursor = 0;
        ctx.state = State::SendingRequest;
        tracing::debug!(
            context = id.index(),
            backend,
            head = end,
            bytes = ctx.len,
            "request received"
        );
        Ok(())
    }

    fn send_request(&mut self, id: ContextId) -> Result<()> {
        let needs_backend = self.pool.get(id).is_some_and(|c| c.backend.is_none());
        if needs_backend {
            return self.open_backend(id);
        }

        let Some(ctx) = self.pool.get_mut(id) else {
            return Ok(());
        };
        let (Some(conn), Some(slot)) = (ctx.backend.as_mut(), ctx.backend_slot) else {
            return Ok(());
        };

        if !ctx.established {
            if !conn.poll_connected()? {
                self.slots.consume(slot, Interest::Writable);
                return backend_hangup(&self.slots, slot);
            }
            ctx.established = true;
            tracing::debug!(context = id.index(), backend = ?ctx.backend_idx, "backend connected");
        }

        match transfer(conn.write(&ctx.buffer[ctx.cursor..ctx.len]))? {
            Transfer::Bytes(0) => return Err(ProxyError::WriteZero),
            Transfer::Bytes(n) => {
                ctx.cursor += n;
                tracing::trace!(
                    context = id.index(),
                    bytes = n,
                    remaining = ctx.len - ctx.cursor,
                    "request written"
                );
            }
            Transfer::WouldBlock => {
                self.slots.consume(slot, Interest::Writable);
                return backend_hangup(&self.slots, slot);
            }
            Transfer::Interrupted => return Ok(()),
        }

        if ctx.cursor == ctx.len {
            self.network.reregister(conn, slot, Interest::Readable)?;
            ctx.reset_buffer();
            ctx.state = State::ReceivingResponse;
            tracing::debug!(context = id.index(), "request forwarded");
        }
        Ok(())
    }

    fn receive_response(&mut self, id: ContextId) -> Result<()> {
        let framing = self.limits.framing;
        let Some(ctx) = self.pool.get_mut(id) else {
            return Ok(());
        };
        let (Some(conn), Some(slot)) = (ctx.backend.as_mut(), ctx.backend_slot) else {
            return Err(ProxyError::UpstreamClosed);
        };

        let scanned = ctx.len;
        if scanned == ctx.buffer.len() {
            return Err(ProxyError::BufferFull(scanned));
        }

        let n = match transfer(conn.read(&mut ctx.buffer[scanned..]))? {
            Transfer::Bytes(0) => return Err(ProxyError::UpstreamClosed),
            Transfer::Bytes(n) => n,
            Transfer::WouldBlock => {
                self.slots.consume(slot, Interest::Readable);
                return backend_hangup(&self.slots, slot);
            }
            Transfer::Interrupted => return Ok(()),
        };

        ctx.len += n;
        tracing::trace!(context = id.index(), bytes = n, buffered = ctx.len, "response read");

        let Some(end) = framing.find_boundary(&ctx.buffer[..ctx.len], scanned) else {
            if ctx.len == ctx.buffer.len() {
                return Err(ProxyError::BufferFull(ctx.len));
            }
            return Ok(());
        };

        self.network
            .reregister(&mut ctx.client, ctx.client_slot, Interest::Writable)?;

        ctx.cursor = 0;
        ctx.state = State::SendingResponse;

        if let Some(backend) = ctx.backend_idx.and_then(|idx| self.backends.get_mut(idx)) {
            backend.record_success();
        }
        tracing::debug!(context = id.index(), head = end, bytes = ctx.len, "response received");
        Ok(())
    }

    fn send_response(&mut self, id: ContextId) -> Result<()> {
        let Some(ctx) = self.pool.get_mut(id) else {
            return Ok(());
        };

        match transfer(ctx.client.write(&ctx.buffer[ctx.cursor..ctx.len]))? {
            Transfer::Bytes(0) => return Err(ProxyError::WriteZero),
            Transfer::Bytes(n) => {
                ctx.cursor += n;
                tracing::trace!(
                    context = id.index(),
                    bytes = n,
                    remaining = ctx.len - ctx.cursor,
                    "response written"
                );
            }
            Transfer::WouldBlock => self.slots.consume(ctx.client_slot, Interest::Writable),
            Transfer::Interrupted => {}
        }

        if ctx.cursor == ctx.len {
            ctx.state = State::Done;
            tracing::debug!(context = id.index(), "response relayed");
        }
        Ok(())
    }

    fn send_error(&mut self, id: ContextId) -> Result<()> {
        let Some(ctx) = self.pool.get_mut(id) else {
            return Ok(());
        };

        match transfer(ctx.client.write(&ERROR_RESPONSE[ctx.cursor..]))? {
            Transfer::Bytes(0) => return Err(ProxyError::WriteZero),
            Transfer::Bytes(n) => ctx.cursor += n,
            Transfer::WouldBlock => self.slots.consume(ctx.client_slot, Interest::Writable),
            Transfer::Interrupted => {}
        }

        if ctx.cursor == ERROR_RESPONSE.len() {
            ctx.state = State::Done;
            tracing::debug!(context = id.index(), "error response sent");
        }
        Ok(())
    }
}

/// A backend that hung up will never become ready again
fn backend_hangup(slots: &SlotTable, slot: SlotId) -> Result<()> {
    if slots.readiness(slot).hangup {
        return Err(ProxyError::BackendHangup);
    }
    Ok(())
}
