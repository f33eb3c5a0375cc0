use crate::{
    arena::{Arena, Handle},
    connection::ConnectionId,
};
use std::fmt;

/// Work request id
///
/// The 64-bit value carried by a posted work request and echoed back in its completion.
/// It is an arena handle, so a stale or foreign id simply resolves to nothing.
#[derive(PartialEq, Eq, Hash, Clone, Copy)]
pub struct WorkRequestId(u64);

impl WorkRequestId {
    /// Wrap a raw id taken from a completion
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The arena handle behind this id
    pub(crate) const fn handle(self) -> Handle {
        Handle::from_u64(self.0)
    }
}

impl fmt::Debug for WorkRequestId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkRequestId({})", self.handle())
    }
}

impl From<WorkRequestId> for u64 {
    #[inline]
    fn from(wr_id: WorkRequestId) -> Self {
        wr_id.0
    }
}

impl From<Handle> for WorkRequestId {
    #[inline]
    fn from(handle: Handle) -> Self {
        Self(handle.to_u64())
    }
}

/// Which buffer an outstanding work request uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSlot {
    /// Slot of the connection's own receive pool
    Pool(usize),
    /// Slot of the worker's shared receive pool
    Shared(usize),
    /// The connection's dedicated send buffer
    Send,
    /// A one-off buffer owned by the connection (chunk, read target, write source)
    OneOff(u64),
}

/// Per-outstanding-work-request record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkContext {
    /// Owning connection, `None` for buffers of a shared receive pool
    pub conn: Option<ConnectionId>,
    /// The buffer the request uses
    pub slot: BufferSlot,
}

/// Owner of all outstanding work contexts of one worker
#[derive(Debug, Default)]
pub struct WorkContextArena {
    /// Live contexts
    inner: Arena<WorkContext>,
}

impl WorkContextArena {
    /// Record a context and return the id to post with
    pub(crate) fn insert(&mut self, ctx: WorkContext) -> WorkRequestId {
        self.inner.insert(ctx).into()
    }

    /// Resolve and forget a context, once its completion arrived
    pub(crate) fn remove(&mut self, wr_id: WorkRequestId) -> Option<WorkContext> {
        self.inner.remove(wr_id.handle())
    }

    /// Resolve a context without forgetting it
    #[inline]
    #[must_use]
    pub fn get(&self, wr_id: WorkRequestId) -> Option<&WorkContext> {
        self.inner.get(wr_id.handle())
    }

    /// Forget every context owned by `conn`, returning how many there were
    pub(crate) fn remove_connection(&mut self, conn: ConnectionId) -> usize {
        self.inner.retain(|ctx| ctx.conn != Some(conn))
    }

    /// Forget every context `keep` rejects, returning how many there were
    pub(crate) fn retain<F: FnMut(&WorkContext) -> bool>(&mut self, keep: F) -> usize {
        self.inner.retain(keep)
    }

    /// Number of outstanding work requests
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether nothing is outstanding
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_resolves_once() {
        let mut contexts = WorkContextArena::default();
        let wr_id = contexts.insert(WorkContext {
            conn: None,
            slot: BufferSlot::Shared(3),
        });
        let raw: u64 = wr_id.into();
        let echoed = WorkRequestId::from_raw(raw);
        assert_eq!(contexts.get(echoed).map(|ctx| ctx.slot), Some(BufferSlot::Shared(3)));
        assert!(contexts.remove(echoed).is_some());
        assert!(contexts.remove(echoed).is_none());
        assert!(contexts.is_empty());
    }

    #[test]
    fn unknown_id_is_not_found() {
        let mut contexts = WorkContextArena::default();
        assert!(contexts.remove(WorkRequestId::from_raw(0xdead_beef)).is_none());
    }
}
