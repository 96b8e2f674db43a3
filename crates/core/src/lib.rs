//! Fulcrum Core - connection-forwarding engine
//!
//! Everything that decides what happens to a client connection lives here:
//! the context pool, the readiness slot table, the per-connection state
//! machine, backend selection and failure handling. Sockets are reached only
//! through the [`Network`] and [`Connection`] traits.
//!
//! # Invariants
//!
//! 1. One `Balancer` per thread, no locks
//! 2. Buffers are allocated once per context, at admission
//! 3. No panic on peer input

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backend;
pub mod engine;
pub mod error;
pub mod io;
pub mod limits;
pub mod pool;
pub mod routing;
pub mod slots;

mod machine;
mod retry;
mod upstream;

#[cfg(test)]
mod testing;

pub use backend::{Backend, BackendRegistry};
pub use engine::{BackendStats, Balancer, BalancerStats};
pub use error::ProxyError;
pub use io::{Connection, Network};
pub use limits::{Framing, Limits, ERROR_RESPONSE};
pub use pool::{ContextId, State};
pub use routing::{RoutingMethod, RoutingPolicy};
pub use slots::{Interest, Readiness, SlotId};
