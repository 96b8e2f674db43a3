//! Fulcrum Server - event loop and socket plumbing
//!
//! Built on mio: one poller, one listener and one `Balancer` on a single
//! thread.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event_loop;
pub mod socket;

pub use event_loop::EventLoop;
pub use socket::{MioNetwork, Stream};
