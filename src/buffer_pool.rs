use crate::{
    access::receive_access,
    connection::ConnectionId,
    error::{Error, Result},
    memory_region::{MrAccess, RegisteredBuffer},
    provider::{EndpointId, SrqId, TransportProvider},
    work_context::{BufferSlot, WorkContext, WorkContextArena},
    work_request::RecvWr,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where pool buffers are posted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostTarget {
    /// The receive queue of one endpoint
    Endpoint(EndpointId),
    /// A shared receive queue
    Shared(SrqId),
}

/// A fixed set of registered receive buffers, all posted while the owner is live.
///
/// Every buffer that is not currently handed to a handler is posted exactly once. Buffers
/// keep their address, key and length across re-posts. A buffer that turned out too small
/// is swapped for a larger one in the same slot, so the slot count never changes.
#[derive(Debug)]
pub struct BufferPool {
    /// Where the buffers are posted
    target: PostTarget,
    /// Owning connection, `None` for a shared pool
    owner: Option<ConnectionId>,
    /// Size of the regular buffers
    buffer_size: usize,
    /// Buffers by slot; a slot is empty while its buffer is lent out or after release
    slots: Vec<Option<RegisteredBuffer>>,
    /// Buffers currently posted
    posted: usize,
}

impl BufferPool {
    /// Allocate, register and post `count` buffers of `size` bytes.
    ///
    /// Fails atomically: buffers registered or posted before the failure are withdrawn,
    /// deregistered and freed.
    pub fn acquire_all(
        provider: &Arc<dyn TransportProvider>,
        contexts: &mut WorkContextArena,
        owner: Option<ConnectionId>,
        target: PostTarget,
        count: usize,
        size: usize,
    ) -> Result<Self> {
        let mut registered =
            scopeguard::guard(Vec::with_capacity(count), |buffers: Vec<RegisteredBuffer>| {
                if !buffers.is_empty() {
                    warn!("releasing {} buffers of a partially acquired pool", buffers.len());
                }
            });
        for _ in 0..count {
            registered.push(RegisteredBuffer::register(provider, size, receive_access())?);
        }
        let buffers = scopeguard::ScopeGuard::into_inner(registered);

        let mut pool = Self {
            target,
            owner,
            buffer_size: size,
            slots: buffers.into_iter().map(Some).collect(),
            posted: 0,
        };
        for index in 0..count {
            if let Err(err) = pool.post(index, provider.as_ref(), contexts) {
                pool.abandon(contexts);
                return Err(err);
            }
        }
        debug!(
            "pool of {} x {} bytes posted to {:?}",
            count, size, target
        );
        Ok(pool)
    }

    /// Post the buffer in `index`
    fn post(
        &mut self,
        index: usize,
        provider: &dyn TransportProvider,
        contexts: &mut WorkContextArena,
    ) -> Result<()> {
        let buffer = self.slots[index]
            .as_ref()
            .ok_or_else(|| Error::invalid_state(format!("pool slot {index} is empty")))?;
        let slot = match self.target {
            PostTarget::Endpoint(_) => BufferSlot::Pool(index),
            PostTarget::Shared(_) => BufferSlot::Shared(index),
        };
        let wr_id = contexts.insert(WorkContext {
            conn: self.owner,
            slot,
        });
        let wr = RecvWr::new_recv(buffer.full_sge(), wr_id);
        let posted = match self.target {
            PostTarget::Endpoint(ep) => provider.post_recv(ep, wr),
            PostTarget::Shared(srq) => provider.post_srq_recv(srq, wr),
        };
        if let Err(err) = posted {
            let _ctx = contexts.remove(wr_id);
            return Err(err.into());
        }
        self.posted = self.posted.saturating_add(1);
        Ok(())
    }

    /// Withdraw every outstanding receive context and drop every buffer
    fn abandon(&mut self, contexts: &mut WorkContextArena) {
        let owner = self.owner;
        let withdrawn = contexts.retain(|ctx| {
            ctx.conn != owner || !matches!(ctx.slot, BufferSlot::Pool(_) | BufferSlot::Shared(_))
        });
        debug!("abandoning pool on {:?}, {} receives withdrawn", self.target, withdrawn);
        self.release_all();
    }

    /// Take the buffer of a completed receive out of its slot.
    ///
    /// The slot stays reserved until `repost` or `restore` puts the buffer back.
    pub fn take(&mut self, index: usize) -> Option<RegisteredBuffer> {
        let buffer = self.slots.get_mut(index)?.take()?;
        self.posted = self.posted.saturating_sub(1);
        Some(buffer)
    }

    /// Put a taken buffer back and post it again
    pub fn repost(
        &mut self,
        index: usize,
        buffer: RegisteredBuffer,
        provider: &dyn TransportProvider,
        contexts: &mut WorkContextArena,
    ) -> Result<()> {
        self.restore(index, buffer);
        self.post(index, provider, contexts)
    }

    /// Put a taken buffer back without posting it, used while tearing down
    pub fn restore(&mut self, index: usize, buffer: RegisteredBuffer) {
        match self.slots.get_mut(index) {
            Some(slot) => *slot = Some(buffer),
            None => warn!("buffer restored into unknown slot {}", index),
        }
    }

    /// Deregister and free one buffer. Teardown only.
    pub fn release(&mut self, index: usize) -> bool {
        self.slots
            .get_mut(index)
            .and_then(Option::take)
            .map(drop)
            .is_some()
    }

    /// Deregister and free every buffer
    pub fn release_all(&mut self) {
        for slot in &mut self.slots {
            drop(slot.take());
        }
        self.posted = 0;
    }

    /// Number of buffers currently posted
    #[inline]
    #[must_use]
    pub const fn posted(&self) -> usize {
        self.posted
    }

    /// Number of slots
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Size of the regular buffers
    #[inline]
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Where the buffers are posted
    #[inline]
    #[must_use]
    pub const fn target(&self) -> PostTarget {
        self.target
    }

    /// Look at a buffer that is currently in its slot
    #[inline]
    #[must_use]
    pub fn buffer(&self, index: usize) -> Option<&RegisteredBuffer> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Largest buffer length in the pool
    #[inline]
    #[must_use]
    pub fn largest_buffer(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(MrAccess::length)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{loopback::LoopbackProvider, QpInitAttr};

    fn setup(max_recv_wr: u32) -> (Arc<LoopbackProvider>, Arc<dyn TransportProvider>, EndpointId) {
        let loopback = Arc::new(LoopbackProvider::new());
        let provider: Arc<dyn TransportProvider> = Arc::<LoopbackProvider>::clone(&loopback);
        let ch = provider.create_cm_channel().unwrap();
        let cq = provider.create_cq(64).unwrap();
        let ep = provider.create_id(ch).unwrap();
        provider
            .create_qp(
                ep,
                &QpInitAttr {
                    cq,
                    srq: None,
                    max_send_wr: 8,
                    max_recv_wr,
                },
            )
            .unwrap();
        (loopback, provider, ep)
    }

    #[test]
    fn acquire_posts_every_buffer() {
        let (loopback, provider, ep) = setup(16);
        let mut contexts = WorkContextArena::default();
        let pool = BufferPool::acquire_all(&provider, &mut contexts, None, PostTarget::Endpoint(ep), 8, 1024)
            .unwrap();
        assert_eq!(pool.posted(), 8);
        assert_eq!(pool.capacity(), 8);
        assert_eq!(loopback.posted_receives(ep), 8);
        assert_eq!(contexts.len(), 8);
        assert_eq!(loopback.registered_regions(), 8);
    }

    #[test]
    fn failed_post_leaves_nothing_behind() {
        // the queue holds four receives, the fifth post fails
        let (loopback, provider, ep) = setup(4);
        let mut contexts = WorkContextArena::default();
        let err = BufferPool::acquire_all(&provider, &mut contexts, None, PostTarget::Endpoint(ep), 5, 256)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Provider);
        assert_eq!(loopback.registered_regions(), 0);
        assert_eq!(loopback.posted_receives(ep), 0);
    }

    #[test]
    fn repost_keeps_address_key_and_length() {
        let (loopback, provider, ep) = setup(16);
        let mut contexts = WorkContextArena::default();
        let mut pool = BufferPool::acquire_all(&provider, &mut contexts, None, PostTarget::Endpoint(ep), 2, 512)
            .unwrap();
        let before = pool.buffer(1).map(|b| (b.addr(), b.lkey(), b.rkey(), b.length())).unwrap();
        let buffer = pool.take(1).unwrap();
        assert_eq!(pool.posted(), 1);
        pool.repost(1, buffer, provider.as_ref(), &mut contexts).unwrap();
        let after = pool.buffer(1).map(|b| (b.addr(), b.lkey(), b.rkey(), b.length())).unwrap();
        assert_eq!(before, after);
        assert_eq!(pool.posted(), 2);
        assert_eq!(loopback.registered_regions(), 2);
    }

    #[test]
    fn larger_buffer_takes_the_slot_of_a_small_one() {
        let (loopback, provider, ep) = setup(4);
        let mut contexts = WorkContextArena::default();
        let mut pool = BufferPool::acquire_all(&provider, &mut contexts, None, PostTarget::Endpoint(ep), 4, 1024)
            .unwrap();
        for round in 1..=3_usize {
            let small = pool.take(2).unwrap();
            let larger = RegisteredBuffer::register(&provider, round * 20 * 1024, receive_access()).unwrap();
            drop(small);
            // the receive queue is full again, with no room to spare
            pool.repost(2, larger, provider.as_ref(), &mut contexts).unwrap();
            assert_eq!(pool.posted(), 4);
            assert_eq!(pool.capacity(), 4);
            assert_eq!(loopback.posted_receives(ep), 4);
            assert_eq!(loopback.registered_regions(), 4);
            assert_eq!(pool.largest_buffer(), round * 20 * 1024);
        }
        assert_eq!(pool.buffer_size(), 1024);
    }
}
