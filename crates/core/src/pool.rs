//! Connection contexts and the fixed-capacity pool that owns them
//!
//! The pool is an arena: `ContextId` is a plain index, validated against slot
//! occupancy on every lookup. Nothing outside the pool holds a context.

use crate::slots::{Interest, SlotId};

/// Index of a context in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(usize);

impl ContextId {
    /// Raw pool index
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl From<usize> for ContextId {
    fn from(index: usize) -> Self {
        ContextId(index)
    }
}

/// Forwarding pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Reading the request from the client
    ReceivingRequest,
    /// Connecting to the backend and writing the request
    SendingRequest,
    /// Reading the response from the backend
    ReceivingResponse,
    /// Writing the response to the client
    SendingResponse,
    /// Writing the fixed error response to the client
    Error,
    /// Finished, waiting for teardown
    Done,
}

/// What a context needs before its next step can run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Readiness on the client socket
    Client(Interest),
    /// Readiness on the backend socket
    Backend(Interest),
    /// Nothing, the step can run on the next pass
    Runnable,
}

/// Per-request forwarding state
#[derive(Debug)]
pub struct Context<C> {
    pub(crate) id: ContextId,
    pub(crate) state: State,

    pub(crate) client: C,
    pub(crate) client_slot: SlotId,

    pub(crate) backend: Option<C>,
    pub(crate) backend_slot: Option<SlotId>,
    /// Registry index of the chosen backend
    pub(crate) backend_idx: Option<usize>,
    /// Outbound connect has completed
    pub(crate) established: bool,
    /// Backend selections made for this request
    pub(crate) tries: u32,

    pub(crate) buffer: Box<[u8]>,
    /// Valid bytes in `buffer`
    pub(crate) len: usize,
    /// Bytes of `buffer[..len]` already written out
    pub(crate) cursor: usize,
}

impl<C> Context<C> {
    pub(crate) fn new(id: ContextId, client: C, client_slot: SlotId, buffer_size: usize) -> Self {
        Self {
            id,
            state: State::ReceivingRequest,
            client,
            client_slot,
            backend: None,
            backend_slot: None,
            backend_idx: None,
            established: false,
            tries: 0,
            buffer: vec![0u8; buffer_size].into_boxed_slice(),
            len: 0,
            cursor: 0,
        }
    }

    /// Pool index
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Current stage
    pub fn state(&self) -> State {
        self.state
    }

    /// Chosen backend, if any
    pub fn backend_index(&self) -> Option<usize> {
        self.backend_idx
    }

    /// Backend selections made so far
    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Client socket slot
    pub fn client_slot(&self) -> SlotId {
        self.client_slot
    }

    /// Backend socket slot, once a backend connection exists
    pub fn backend_slot(&self) -> Option<SlotId> {
        self.backend_slot
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Readiness the next step depends on
    pub fn wait(&self) -> Wait {
        match self.state {
            State::ReceivingRequest => Wait::Client(Interest::Readable),
            State::SendingRequest if self.backend.is_none() => Wait::Runnable,
            State::SendingRequest => Wait::Backend(Interest::Writable),
            State::ReceivingResponse => Wait::Backend(Interest::Readable),
            State::SendingResponse | State::Error => Wait::Client(Interest::Writable),
            State::Done => Wait::Runnable,
        }
    }

    pub(crate) fn reset_buffer(&mut self) {
        self.len = 0;
        self.cursor = 0;
    }
}

/// Fixed-capacity context arena
#[derive(Debug)]
pub struct ConnectionPool<C> {
    contexts: Vec<Option<Context<C>>>,
    in_use: usize,
}

impl<C> ConnectionPool<C> {
    /// Create an empty pool
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            contexts: (0..capacity).map(|_| None).collect(),
            in_use: 0,
        }
    }

    /// Maximum number of concurrent contexts
    pub fn capacity(&self) -> usize {
        self.contexts.len()
    }

    /// Contexts currently allocated
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Lowest free index (linear scan)
    pub fn free_id(&self) -> Option<ContextId> {
        self.contexts
            .iter()
            .position(Option::is_none)
            .map(ContextId)
    }

    /// Store a context at its own index. The index must be free.
    pub(crate) fn insert(&mut self, ctx: Context<C>) {
        let entry = &mut self.contexts[ctx.id.0];
        debug_assert!(entry.is_none(), "context slot {} already in use", ctx.id.0);
        if entry.is_none() {
            self.in_use += 1;
        }
        *entry = Some(ctx);
    }

    /// Get a live context
    #[inline]
    pub fn get(&self, id: ContextId) -> Option<&Context<C>> {
        self.contexts.get(id.0).and_then(Option::as_ref)
    }

    /// Get a live context, mutably
    #[inline]
    pub fn get_mut(&mut self, id: ContextId) -> Option<&mut Context<C>> {
        self.contexts.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Take a context out of the pool. Removing a free index returns `None`.
    pub(crate) fn remove(&mut self, id: ContextId) -> Option<Context<C>> {
        let ctx = self.contexts.get_mut(id.0)?.take()?;
        self.in_use -= 1;
        Some(ctx)
    }

    /// Iterate over live contexts in index order
    pub fn iter(&self) -> impl Iterator<Item = &Context<C>> {
        self.contexts.iter().filter_map(Option::as_ref)
    }
}
