//! The balancer: one object owning every piece of forwarding state
//!
//! The event loop feeds readiness in through [`Balancer::notify`], hands
//! accepted clients to [`Balancer::admit`] and then runs exactly one
//! [`Balancer::dispatch`] pass. Each pass gives every runnable context a
//! single step, in pool index order.

use std::net::SocketAddr;
use std::time::Instant;

use crate::backend::BackendRegistry;
use crate::io::Network;
use crate::limits::Limits;
use crate::pool::{ConnectionPool, Context, ContextId, State, Wait};
use crate::routing::{RoutingMethod, RoutingPolicy};
use crate::slots::{Interest, Lease, Readiness, SlotId, SlotTable};

/// Connection-forwarding engine
#[derive(Debug)]
pub struct Balancer<N: Network> {
    pub(crate) network: N,
    pub(crate) pool: ConnectionPool<N::Conn>,
    pub(crate) slots: SlotTable,
    pub(crate) backends: BackendRegistry,
    pub(crate) policy: RoutingPolicy,
    pub(crate) limits: Limits,
}

impl<N: Network> Balancer<N> {
    /// Create a balancer over the given backends
    pub fn new(
        network: N,
        backends: BackendRegistry,
        method: RoutingMethod,
        limits: Limits,
    ) -> Self {
        let backends = backends.with_revive_after(limits.revive_after);

        Self {
            network,
            pool: ConnectionPool::with_capacity(limits.max_contexts),
            slots: SlotTable::new(limits.max_contexts),
            backends,
            policy: RoutingPolicy::new(method),
            limits,
        }
    }

    /// Connection pool
    pub fn pool(&self) -> &ConnectionPool<N::Conn> {
        &self.pool
    }

    /// Readiness registration table
    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    /// Backend registry
    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Routing method in use
    pub fn routing_method(&self) -> RoutingMethod {
        self.policy.method()
    }

    /// Active limits
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Record readiness reported by the poller for a slot
    #[inline]
    pub fn notify(&mut self, slot: SlotId, readiness: Readiness) {
        self.slots.mark_ready(slot, readiness);
    }

    /// Admit an accepted client.
    ///
    /// Returns `None` when the pool is full; the connection is dropped, which
    /// closes it.
    pub fn admit(&mut self, mut client: N::Conn) -> Option<ContextId> {
        let Some(id) = self.pool.free_id() else {
            tracing::debug!(capacity = self.pool.capacity(), "pool full, dropping client");
            return None;
        };

        let Some(slot) = self.slots.lease(Lease::Client(id)) else {
            tracing::debug!("readiness table full, dropping client");
            return None;
        };

        if let Err(err) = self.network.register(&mut client, slot, Interest::Readable) {
            tracing::warn!(error = %err, "failed to register client");
            self.slots.release(slot);
            return None;
        }

        self.pool
            .insert(Context::new(id, client, slot, self.limits.buffer_size));
        tracing::debug!(context = id.index(), slot = slot.index(), "client admitted");
        Some(id)
    }

    /// Run one dispatch pass. Returns the number of steps taken.
    pub fn dispatch(&mut self) -> usize {
        self.backends.revive_expired(Instant::now());

        let mut steps = 0;
        for index in 0..self.pool.capacity() {
            let id = ContextId::from(index);
            let Some(ctx) = self.pool.get(id) else {
                continue;
            };

            if self.slots.readiness(ctx.client_slot).hangup {
                tracing::debug!(context = index, state = ?ctx.state, "client hung up");
                self.teardown(id);
                continue;
            }

            if !self.is_runnable(ctx) {
                continue;
            }

            self.step(id);
            steps += 1;

            if self.pool.get(id).is_some_and(|c| c.state == State::Done) {
                self.teardown(id);
            }
        }

        steps
    }

    /// Whether a pass would do work without any new readiness.
    ///
    /// The event loop polls with a zero timeout while this holds.
    pub fn has_runnable(&self) -> bool {
        self.pool
            .iter()
            .any(|ctx| self.slots.readiness(ctx.client_slot).hangup || self.is_runnable(ctx))
    }

    fn is_runnable(&self, ctx: &Context<N::Conn>) -> bool {
        match ctx.wait() {
            Wait::Runnable => true,
            Wait::Client(interest) => self.slots.readiness(ctx.client_slot).satisfies(interest),
            Wait::Backend(interest) => ctx.backend_slot.is_some_and(|slot| {
                let ready = self.slots.readiness(slot);
                ready.hangup || ready.satisfies(interest)
            }),
        }
    }

    /// Destroy a context: close both sockets and release its slots.
    /// Tearing down a free index is a no-op.
    pub(crate) fn teardown(&mut self, id: ContextId) {
        self.close_backend(id);

        let Some(mut ctx) = self.pool.remove(id) else {
            return;
        };

        if let Err(err) = self.network.deregister(&mut ctx.client) {
            tracing::debug!(context = id.index(), error = %err, "client deregister failed");
        }
        debug_assert_eq!(self.slots.owner(ctx.client_slot), Some(Lease::Client(id)));
        self.slots.release(ctx.client_slot);

        tracing::debug!(context = id.index(), state = ?ctx.state, "context closed");
    }

    /// Snapshot of pool and backend counters
    pub fn stats(&self) -> BalancerStats {
        BalancerStats {
            contexts: self.pool.in_use(),
            leased_slots: self.slots.connection_leases(),
            backends: self
                .backends
                .iter()
                .map(|b| BackendStats {
                    addr: b.addr,
                    alive: b.is_alive(),
                    active_connections: b.active_connections(),
                    consecutive_errors: b.consecutive_errors(),
                    total_requests: b.total_requests(),
                })
                .collect(),
        }
    }
}

/// Counters for one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStats {
    /// Backend address
    pub addr: SocketAddr,
    /// Still in rotation
    pub alive: bool,
    /// Open connections
    pub active_connections: usize,
    /// Errors since last success
    pub consecutive_errors: u32,
    /// Responses relayed
    pub total_requests: u64,
}

/// Point-in-time balancer counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancerStats {
    /// Contexts in use
    pub contexts: usize,
    /// Readiness slots leased to contexts
    pub leased_slots: usize,
    /// Per-backend counters in configured order
    pub backends: Vec<BackendStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::limits::ERROR_RESPONSE;
    use crate::testing::{pump, pump_until_idle, MockNetwork};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn balancer(
        net: &MockNetwork,
        ports: &[u16],
        method: RoutingMethod,
        limits: Limits,
    ) -> Balancer<MockNetwork> {
        let backends =
            BackendRegistry::new(ports.iter().map(|p| Backend::from_addr(addr(*p))).collect());
        Balancer::new(net.clone(), backends, method, limits)
    }

    fn small_limits() -> Limits {
        Limits {
            max_contexts: 4,
            buffer_size: 64,
            ..Limits::default()
        }
    }

    #[test]
    fn test_end_to_end_round_trip() {
        let net = MockNetwork::default();
        let mut lb = balancer(&net, &[9001, 9002], RoutingMethod::RoundRobin, small_limits());

        let client = net.client();
        let id = lb.admit(client.clone()).unwrap();
        client.push(b"GET / \n");

        // ReceivingRequest -> SendingRequest, backend 0 chosen
        pump(&mut lb);
        let ctx = lb.pool().get(id).unwrap();
        assert_eq!(ctx.state(), State::SendingRequest);
        assert_eq!(ctx.backend_index(), Some(0));

        // Connect started
        pump(&mut lb);
        assert_eq!(net.dialed()[0].0, addr(9001));
        assert_eq!(lb.backends().get(0).unwrap().active_connections(), 1);

        // Request written, waiting for the response
        pump(&mut lb);
        assert_eq!(lb.pool().get(id).unwrap().state(), State::ReceivingResponse);
        let backend = net.last_backend();
        assert_eq!(backend.written(), b"GET / \n");

        backend.push(b"HTTP/1.1 200 OK\r\n");
        pump(&mut lb);
        assert_eq!(lb.pool().get(id).unwrap().state(), State::SendingResponse);

        pump(&mut lb);
        assert!(lb.pool().get(id).is_none());
        assert_eq!(client.written(), b"HTTP/1.1 200 OK\r\n");

        let stats = lb.stats();
        assert_eq!(stats.contexts, 0);
        assert_eq!(stats.leased_slots, 0);
        assert_eq!(stats.backends[0].active_connections, 0);
        assert_eq!(stats.backends[0].total_requests, 1);
        assert_eq!(net.registered(), 0);
    }

    #[test]
    fn test_one_step_per_pass() {
        let net = MockNetwork::default();
        let mut lb = balancer(&net, &[9001], RoutingMethod::RoundRobin, small_limits());

        let client = net.client();
        let id = lb.admit(client.clone()).unwrap();
        client.push(b"GET / \n");

        assert_eq!(pump(&mut lb), 1);
        // Connect has not been attempted in the same pass
        assert!(net.dialed().is_empty());
        assert_eq!(lb.pool().get(id).unwrap().state(), State::SendingRequest);
    }

    #[test]
    fn test_request_split_across_reads() {
        let net = MockNetwork::default();
        let mut lb = balancer(&net, &[9001], RoutingMethod::RoundRobin, small_limits());

        let client = net.client();
        let id = lb.admit(client.clone()).unwrap();

        client.push(b"GET ");
        pump(&mut lb);
        assert_eq!(lb.pool().get(id).unwrap().state(), State::ReceivingRequest);

        // The read made progress, so readiness is still held
        assert!(lb.has_runnable());
        lb.dispatch();

        // That pass hit would-block; nothing runs until new data
        assert!(!lb.has_runnable());
        assert_eq!(lb.pool().get(id).unwrap().buffered(), b"GET ");

        client.push(b"/ \n");
        pump(&mut lb);
        let ctx = lb.pool().get(id).unwrap();
        assert_eq!(ctx.state(), State::SendingRequest);
        assert_eq!(ctx.buffered(), b"GET / \n");
        assert!(lb.has_runnable());
    }

    #[test]
    fn test_partial_writes_resume() {
        let net = MockNetwork::default();
        let mut lb = balancer(&net, &[9001], RoutingMethod::RoundRobin, small_limits());

        let client = net.client();
        client.set_write_limit(3);
        let id = lb.admit(client.clone()).unwrap();
        client.push(b"GET /index.html \n");

        pump(&mut lb);
        pump(&mut lb);
        let backend = net.last_backend();
        backend.set_write_limit(4);

        // 17 bytes at 4 per write
        for _ in 0..4 {
            pump(&mut lb);
            assert_eq!(lb.pool().get(id).unwrap().state(), State::SendingRequest);
        }
        pump(&mut lb);
        assert_eq!(backend.written(), b"GET /index.html \n");
        assert_eq!(lb.pool().get(id).unwrap().state(), State::ReceivingResponse);

        backend.push(b"HTTP/1.1 204 No Content\r\n");
        pump_until_idle(&mut lb, 32);

        assert_eq!(client.written(), b"HTTP/1.1 204 No Content\r\n");
        assert_eq!(lb.pool().in_use(), 0);
    }

    #[test]
    fn test_blocked_client_write_waits() {
        let net = MockNetwork::default();
        let mut lb = balancer(&net, &[9001], RoutingMethod::RoundRobin, small_limits());

        let client = net.client();
        let id = lb.admit(client.clone()).unwrap();
        client.push(b"GET / \n");
        pump(&mut lb);
        pump(&mut lb);
        pump(&mut lb);
        net.last_backend().push(b"OK\n");
        pump(&mut lb);

        client.block_writes(true);
        pump(&mut lb);
        assert_eq!(lb.pool().get(id).unwrap().state(), State::SendingResponse);
        assert!(!lb.has_runnable());

        client.block_writes(false);
        pump(&mut lb);
        assert!(lb.pool().get(id).is_none());
        assert_eq!(client.written(), b"OK\n");
    }

    #[test]
    fn test_pool_boundedness() {
        let net = MockNetwork::default();
        let mut lb = balancer(&net, &[9001], RoutingMethod::RoundRobin, small_limits());

        for _ in 0..4 {
            assert!(lb.admit(net.client()).is_some());
        }
        let extra = net.client();
        assert!(lb.admit(extra.clone()).is_none());
        assert_eq!(extra.registration(), None);
        assert_eq!(lb.pool().in_use(), 4);
        assert_eq!(lb.slots().connection_leases(), 4);
    }

    #[test]
    fn test_slot_reclamation_soak() {
        let net = MockNetwork::default();
        let mut lb = balancer(&net, &[9001, 9002], RoutingMethod::LeastConnected, small_limits());

        for round in 0..50 {
            let clients: Vec<_> = (0..4).map(|_| net.client()).collect();
            for client in &clients {
                lb.admit(client.clone()).unwrap();
                client.push(b"GET / \n");
            }

            // Request -> connect -> write
            for _ in 0..3 {
                pump(&mut lb);
            }
            for (_, backend) in net.dialed().iter().skip(round * 4) {
                backend.push(b"OK\n");
            }
            pump_until_idle(&mut lb, 8);

            for client in &clients {
                assert_eq!(client.written(), b"OK\n");
            }
            assert_eq!(lb.pool().in_use(), 0);
            assert_eq!(lb.slots().connection_leases(), 0);
        }

        assert_eq!(net.registered(), 0);
        let stats = lb.stats();
        assert!(stats.backends.iter().all(|b| b.active_connections == 0));
        assert_eq!(stats.backends.iter().map(|b| b.total_requests).sum::<u64>(), 200);
    }

    #[test]
    fn test_client_eof_before_request() {
        let net = MockNetwork::default();
        let mut lb = balancer(&net, &[9001], RoutingMethod::RoundRobin, small_limits());

        let client = net.client();
        lb.admit(client.clone()).unwrap();
        client.push(b"GET");
        client.close();

        pump(&mut lb);
        pump(&mut lb);
        assert_eq!(lb.pool().in_use(), 0);
        assert!(client.written().is_empty());
        assert!(net.dialed().is_empty());
    }

    #[test]
    fn test_client_hangup_tears_down() {
        let net = MockNetwork::default();
        let mut lb = balancer(&net, &[9001], RoutingMethod::RoundRobin, small_limits());

        let client = net.client();
        let id = lb.admit(client.clone()).unwrap();
        client.push(b"GET / \n");
        pump(&mut lb);
        pump(&mut lb);
        assert_eq!(lb.backends().get(0).unwrap().active_connections(), 1);

        let slot = lb.pool().get(id).unwrap().client_slot();
        lb.notify(slot, Readiness::hangup());
        assert!(lb.has_runnable());
        lb.dispatch();

        assert_eq!(lb.pool().in_use(), 0);
        assert_eq!(lb.slots().connection_leases(), 0);
        assert_eq!(lb.backends().get(0).unwrap().active_connections(), 0);
        assert!(client.written().is_empty());
    }

    #[test]
    fn test_oversized_request_gets_error() {
        let net = MockNetwork::default();
        let mut lb = balancer(&net, &[9001], RoutingMethod::RoundRobin, small_limits());

        let client = net.client();
        lb.admit(client.clone()).unwrap();
        client.push(&[b'a'; 64]);

        pump_until_idle(&mut lb, 4);
        assert_eq!(client.written(), ERROR_RESPONSE);
        assert!(net.dialed().is_empty());
    }

    #[test]
    fn test_header_block_framing() {
        let net = MockNetwork::default();
        let limits = Limits {
            framing: crate::limits::Framing::HeaderBlock,
            ..small_limits()
        };
        let mut lb = balancer(&net, &[9001], RoutingMethod::RoundRobin, limits);

        let client = net.client();
        let id = lb.admit(client.clone()).unwrap();
        client.push(b"GET / HTTP/1.1\r\n");
        pump(&mut lb);
        assert_eq!(lb.pool().get(id).unwrap().state(), State::ReceivingRequest);

        client.push(b"Host: a\r\n\r\n");
        pump(&mut lb);
        assert_eq!(lb.pool().get(id).unwrap().state(), State::SendingRequest);
    }

    #[test]
    fn test_contexts_are_independent() {
        let net = MockNetwork::default();
        let mut lb = balancer(&net, &[9001], RoutingMethod::RoundRobin, small_limits());

        let good = net.client();
        let bad = net.client();
        lb.admit(good.clone()).unwrap();
        lb.admit(bad.clone()).unwrap();

        good.push(b"GET / \n");
        bad.fail_reads(std::io::ErrorKind::ConnectionReset);

        pump_until_idle(&mut lb, 3);
        net.last_backend().push(b"OK\n");
        pump_until_idle(&mut lb, 8);

        assert_eq!(good.written(), b"OK\n");
        assert_eq!(lb.pool().in_use(), 0);
    }
}
