//! Backend connection manager
//!
//! Outbound connections are created lazily on the first SendingRequest step.
//! The connect itself is non-blocking; completion is observed later through
//! write readiness and `Connection::poll_connected`.

use std::io;

use crate::engine::Balancer;
use crate::error::{ProxyError, Result};
use crate::io::Network;
use crate::pool::ContextId;
use crate::slots::{Interest, Lease};

impl<N: Network> Balancer<N> {
    /// Start connecting a context to its chosen backend
    pub(crate) fn open_backend(&mut self, id: ContextId) -> Result<()> {
        let Some(ctx) = self.pool.get_mut(id) else {
            return Ok(());
        };
        let Some(idx) = ctx.backend_idx else {
            return Err(ProxyError::NoBackendAvailable);
        };
        let Some(backend) = self.backends.get_mut(idx) else {
            return Err(ProxyError::NoBackendAvailable);
        };

        let slot = self.slots.lease(Lease::Backend(id)).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "readiness table exhausted")
        })?;

        let mut conn = match self.network.connect(backend.addr) {
            Ok(conn) => conn,
            Err(err) => {
                self.slots.release(slot);
                return Err(err.into());
            }
        };

        if let Err(err) = self.network.register(&mut conn, slot, Interest::Writable) {
            self.slots.release(slot);
            return Err(err.into());
        }

        backend.inc_connections();
        ctx.backend = Some(conn);
        ctx.backend_slot = Some(slot);
        ctx.established = false;

        tracing::debug!(
            context = id.index(),
            backend = idx,
            addr = %backend.addr,
            attempt = ctx.tries,
            "connecting to backend"
        );
        Ok(())
    }

    /// Close a context's backend connection, if any, and release its slot
    pub(crate) fn close_backend(&mut self, id: ContextId) {
        let Some(ctx) = self.pool.get_mut(id) else {
            return;
        };

        if let Some(mut conn) = ctx.backend.take() {
            if let Err(err) = self.network.deregister(&mut conn) {
                tracing::debug!(context = id.index(), error = %err, "backend deregister failed");
            }
            if let Some(backend) = ctx.backend_idx.and_then(|idx| self.backends.get_mut(idx)) {
                backend.dec_connections();
            }
        }

        if let Some(slot) = ctx.backend_slot.take() {
            debug_assert_eq!(self.slots.owner(slot), Some(Lease::Backend(id)));
            self.slots.release(slot);
        }
        ctx.established = false;
    }
}
