//! Single-threaded readiness loop
//!
//! Each turn waits on the poller once, folds the reported readiness into the
//! balancer, runs admission for the listener and then a single dispatch pass.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, Result};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Poll, Token};

use fulcrum_config::FulcrumConfig;
use fulcrum_core::{Backend, BackendRegistry, Balancer, Readiness, SlotId};

use crate::socket::{create_listener, MioNetwork, Stream};

const LISTENER: Token = Token(SlotId::LISTENER.index());

/// Poller, listener and balancer for one process
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    balancer: Balancer<MioNetwork>,

    /// Contexts were active after the previous pass
    busy: bool,

    /// An accept failed before the listener would block. The listener is
    /// edge-triggered, so queued connections need another attempt.
    accept_pending: bool,
}

impl EventLoop {
    /// Create the event loop from configuration.
    ///
    /// Binds the listener and resolves every backend; any failure here is
    /// fatal.
    pub fn from_config(config: &FulcrumConfig) -> Result<Self> {
        let backends = resolve_backends(config)?;
        let limits = config.balancer.limits();

        let poll = Poll::new().context("failed to create poller")?;

        let mut listener = create_listener(config.server.listen, config.server.backlog)
            .with_context(|| format!("failed to listen on {}", config.server.listen))?;
        poll.registry()
            .register(&mut listener, LISTENER, mio::Interest::READABLE)
            .context("failed to register listener")?;

        let registry = poll
            .registry()
            .try_clone()
            .context("failed to clone poll registry")?;
        let network = MioNetwork::new(registry, limits.recv_timeout);

        let balancer = Balancer::new(
            network,
            BackendRegistry::new(backends),
            config.balancer.routing.into(),
            limits,
        );

        // One event per slot is the most a single poll can report
        let events = Events::with_capacity(balancer.slots().capacity());

        Ok(Self {
            poll,
            events,
            listener,
            balancer,
            busy: false,
            accept_pending: false,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Engine state
    pub fn balancer(&self) -> &Balancer<MioNetwork> {
        &self.balancer
    }

    /// Run until a fatal poller error
    pub fn run(&mut self) -> Result<()> {
        tracing::info!(
            addr = %self.local_addr()?,
            backends = self.balancer.backends().len(),
            routing = ?self.balancer.routing_method(),
            "Fulcrum listening"
        );

        loop {
            self.turn(None)?;
        }
    }

    /// One loop iteration. Returns the number of steps taken.
    ///
    /// Blocks for at most `timeout` waiting for readiness (forever with
    /// `None`); does not block at all while some context can run without
    /// new readiness.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let timeout = if self.accept_pending || self.balancer.has_runnable() {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err).context("poll failed"),
        }

        let mut accept = self.accept_pending;
        for event in self.events.iter() {
            if event.token() == LISTENER {
                accept = true;
            } else {
                self.balancer
                    .notify(SlotId::from(event.token().0), readiness(event));
            }
        }

        if accept {
            self.accept();
        }

        let steps = self.balancer.dispatch();
        self.log_drain();
        Ok(steps)
    }

    /// Accept until the listener would block
    fn accept(&mut self) {
        self.accept_pending = false;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Some(id) = self.balancer.admit(Stream::new(stream)) {
                        tracing::trace!(context = id.index(), %peer, "accepted");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    self.accept_pending = true;
                    break;
                }
            }
        }
    }

    fn log_drain(&mut self) {
        let busy = self.balancer.pool().in_use() > 0;
        if self.busy && !busy {
            let stats = self.balancer.stats();
            for backend in &stats.backends {
                tracing::debug!(
                    addr = %backend.addr,
                    alive = backend.alive,
                    active = backend.active_connections,
                    errors = backend.consecutive_errors,
                    requests = backend.total_requests,
                    "backend stats"
                );
            }
            tracing::debug!(leased_slots = stats.leased_slots, "all contexts drained");
        }
        self.busy = busy;
    }
}

/// Map a poller event onto slot readiness
fn readiness(event: &Event) -> Readiness {
    Readiness {
        readable: event.is_readable() || event.is_read_closed(),
        writable: event.is_writable() || event.is_write_closed() || event.is_error(),
        hangup: event.is_read_closed() && event.is_write_closed(),
    }
}

fn resolve_backends(config: &FulcrumConfig) -> Result<Vec<Backend>> {
    config
        .backends
        .iter()
        .map(|b| {
            let addr = (b.host.as_str(), b.port)
                .to_socket_addrs()
                .with_context(|| format!("failed to resolve backend {}:{}", b.host, b.port))?
                .next()
                .with_context(|| format!("backend {}:{} resolved to no address", b.host, b.port))?;

            tracing::debug!(host = %b.host, port = b.port, %addr, "backend resolved");
            Ok(Backend::new(b.host.clone(), b.port, addr))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fulcrum_config::BackendConfig;

    #[test]
    fn test_resolve_backends() {
        let mut config = FulcrumConfig::default();
        config.backends.push(BackendConfig {
            host: "127.0.0.1".to_string(),
            port: 9001,
        });

        let backends = resolve_backends(&config).unwrap();
        assert_eq!(backends[0].addr, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(backends[0].host, "127.0.0.1");
    }

    #[test]
    fn test_unresolvable_backend_is_fatal() {
        let mut config = FulcrumConfig::default();
        config.backends.push(BackendConfig {
            host: "no such host.invalid".to_string(),
            port: 9001,
        });

        assert!(resolve_backends(&config).is_err());
    }

    #[test]
    fn test_idle_turn_times_out() {
        let mut config = FulcrumConfig::default();
        config.server.listen = "127.0.0.1:0".parse().unwrap();
        config.backends.push(BackendConfig {
            host: "127.0.0.1".to_string(),
            port: 9001,
        });

        let mut event_loop = EventLoop::from_config(&config).unwrap();
        assert_ne!(event_loop.local_addr().unwrap().port(), 0);
        assert_eq!(event_loop.turn(Some(Duration::from_millis(10))).unwrap(), 0);
    }

    #[test]
    fn test_pending_accept_retried_without_new_event() {
        let mut config = FulcrumConfig::default();
        config.server.listen = "127.0.0.1:0".parse().unwrap();
        config.backends.push(BackendConfig {
            host: "127.0.0.1".to_string(),
            port: 9001,
        });

        let mut event_loop = EventLoop::from_config(&config).unwrap();
        let _client = std::net::TcpStream::connect(event_loop.local_addr().unwrap()).unwrap();

        // Swallow the listener edge, as if accept had failed on it
        let mut seen = false;
        for _ in 0..50 {
            event_loop
                .poll
                .poll(&mut event_loop.events, Some(Duration::from_millis(100)))
                .unwrap();
            if event_loop.events.iter().any(|e| e.token() == LISTENER) {
                seen = true;
                break;
            }
        }
        assert!(seen);
        event_loop.accept_pending = true;

        event_loop.turn(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(event_loop.balancer().pool().in_use(), 1);
        assert!(!event_loop.accept_pending);
    }
}
