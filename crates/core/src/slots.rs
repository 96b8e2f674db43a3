//! Readiness registration table
//!
//! Fixed-capacity table of slots. Slot 0 belongs to the listener, every other
//! slot is leased to a context for its client or backend socket. A slot id
//! doubles as the poll token of the socket registered under it.
//!
//! Readiness reported by the poller is accumulated per slot and only cleared
//! when an operation in that direction would block. This gives level-triggered
//! behaviour on top of an edge-triggered poller.

use crate::pool::ContextId;

/// Index into the slot table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    /// Slot reserved for the listening socket
    pub const LISTENER: SlotId = SlotId(0);

    /// Raw index, used as the poll token
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl From<usize> for SlotId {
    fn from(index: usize) -> Self {
        SlotId(index)
    }
}

/// Direction a socket is waited on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Wait until the socket can be read
    Readable,
    /// Wait until the socket can be written (also signals connect completion)
    Writable,
}

/// Readiness accumulated for one slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Socket has data (or EOF) to read
    pub readable: bool,
    /// Socket accepts writes
    pub writable: bool,
    /// Peer fully closed the connection
    pub hangup: bool,
}

impl Readiness {
    /// Read readiness only
    pub fn readable() -> Self {
        Self {
            readable: true,
            ..Self::default()
        }
    }

    /// Write readiness only
    pub fn writable() -> Self {
        Self {
            writable: true,
            ..Self::default()
        }
    }

    /// Hang-up only
    pub fn hangup() -> Self {
        Self {
            hangup: true,
            ..Self::default()
        }
    }

    /// Read and write readiness
    pub fn both() -> Self {
        Self {
            readable: true,
            writable: true,
            hangup: false,
        }
    }

    /// Check whether the given interest can make progress
    #[inline]
    pub fn satisfies(&self, interest: Interest) -> bool {
        match interest {
            Interest::Readable => self.readable,
            Interest::Writable => self.writable,
        }
    }

    fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.hangup |= other.hangup;
    }

    fn clear(&mut self, interest: Interest) {
        match interest {
            Interest::Readable => self.readable = false,
            Interest::Writable => self.writable = false,
        }
    }
}

/// Who holds a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    /// The listening socket (slot 0)
    Listener,
    /// A context's client socket
    Client(ContextId),
    /// A context's backend socket
    Backend(ContextId),
}

#[derive(Debug, Default)]
struct Slot {
    lease: Option<Lease>,
    ready: Readiness,
}

/// Fixed-capacity slot table
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Slot>,

    /// Free slot indices, popped on lease
    free: Vec<usize>,
}

impl SlotTable {
    /// Create a table with room for the listener plus two sockets per context
    pub fn new(max_contexts: usize) -> Self {
        let capacity = 1 + 2 * max_contexts;
        let mut slots: Vec<Slot> = (0..capacity).map(|_| Slot::default()).collect();
        slots[SlotId::LISTENER.0].lease = Some(Lease::Listener);

        // Reversed so the lowest index is leased first
        let free = (1..capacity).rev().collect();

        Self { slots, free }
    }

    /// Total number of slots, listener included
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently leased to contexts
    pub fn connection_leases(&self) -> usize {
        self.capacity() - 1 - self.free.len()
    }

    /// Lease a free slot
    pub fn lease(&mut self, owner: Lease) -> Option<SlotId> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index];
        slot.lease = Some(owner);
        slot.ready = Readiness::default();
        Some(SlotId(index))
    }

    /// Release a slot. Releasing the listener or an already-free slot is a no-op.
    pub fn release(&mut self, id: SlotId) -> bool {
        if id == SlotId::LISTENER {
            return false;
        }

        match self.slots.get_mut(id.0) {
            Some(slot) if slot.lease.is_some() => {
                slot.lease = None;
                slot.ready = Readiness::default();
                self.free.push(id.0);
                true
            }
            _ => false,
        }
    }

    /// Owner of a slot, if leased
    pub fn owner(&self, id: SlotId) -> Option<Lease> {
        self.slots.get(id.0).and_then(|s| s.lease)
    }

    /// Record readiness reported by the poller. Ignored for free slots.
    pub fn mark_ready(&mut self, id: SlotId, readiness: Readiness) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            if slot.lease.is_some() {
                slot.ready.merge(readiness);
            }
        }
    }

    /// Readiness accumulated for a slot
    #[inline]
    pub fn readiness(&self, id: SlotId) -> Readiness {
        self.slots.get(id.0).map(|s| s.ready).unwrap_or_default()
    }

    /// Forget readiness in one direction after an operation would block
    pub fn consume(&mut self, id: SlotId, interest: Interest) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.ready.clear(interest);
        }
    }
}
