use crate::{
    access::{exposed_read_access, exposed_write_access, receive_access, send_access},
    arena::Handle,
    buffer_pool::BufferPool,
    chunked::split_framed,
    config::EngineConfig,
    error::{Error, Result},
    error_utilities::log_provider_err,
    handler::ConnectionHandler,
    memory_region::{RegisteredBuffer, RemoteDescriptor},
    provider::{EndpointId, TransportProvider},
    work_context::{BufferSlot, WorkContext, WorkContextArena, WorkRequestId},
    work_request::{SendWr, Sge},
};
use clippy_utilities::Cast;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};
use tracing::{debug, trace, warn};

/// Handle of a connection owned by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) Handle);

impl fmt::Display for ConnectionId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Lifecycle of a connection.
///
/// `Resolving -> Connecting -> Established -> Disconnecting -> Closed`, failures go
/// straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Client side, resolving address and route
    Resolving,
    /// Waiting for the connection to be established
    Connecting,
    /// Usable
    Established,
    /// Disconnect requested, flushed work is being drained
    Disconnecting,
    /// Released
    Closed,
}

/// Counters of one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages received
    pub total_recv: u64,
    /// Messages (small or chunk segments) posted for sending
    pub total_sent: u64,
    /// Send-queue completions consumed
    pub send_completions: u64,
    /// One-sided reads and writes posted
    pub remote_ops: u64,
    /// Receive buffers currently posted by the connection's own pool
    pub posted_receives: usize,
    /// Send-queue work requests in flight
    pub outstanding_sends: u32,
    /// Chunk, read, write and exposed buffers currently held
    pub one_off_buffers: usize,
}

/// An entry of the send FIFO
#[derive(Debug)]
enum Outbound {
    /// Message through the dedicated send buffer
    Small(Vec<u8>),
    /// Segment of a chunked message, through its own buffer
    Chunk(Vec<u8>),
    /// One-sided read of the whole region into a fresh buffer
    Read(RemoteDescriptor),
    /// One-sided write of the data into the region
    Write(Vec<u8>, RemoteDescriptor),
}

/// Role of a one-off buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OneOffKind {
    /// Source of a chunk segment
    Chunk,
    /// Target of a one-sided read
    ReadTarget(RemoteDescriptor),
    /// Source of a one-sided write
    WriteSource(RemoteDescriptor),
    /// Region exposed to the peer
    Exposed,
}

/// A buffer registered for one operation or one exposure
#[derive(Debug)]
pub(crate) struct OneOff {
    /// The buffer
    pub(crate) buffer: RegisteredBuffer,
    /// What it is used for
    pub(crate) kind: OneOffKind,
}

/// What a connection owns
#[derive(Debug)]
pub(crate) struct ConnectionCore {
    /// The endpoint of the connection
    pub(crate) endpoint: EndpointId,
    /// Lifecycle state
    pub(crate) state: ConnectionState,
    /// Own receive pool, `None` with a shared receive queue
    pub(crate) pool: Option<BufferPool>,
    /// Dedicated send buffer
    pub(crate) send_buf: Option<RegisteredBuffer>,
    /// Whether the send buffer is in flight
    send_busy: bool,
    /// One-off buffers by key
    one_off: HashMap<u64, OneOff>,
    /// Next one-off key
    next_one_off: u64,
    /// Sends waiting for a send-queue slot, in order
    outbox: VecDeque<Outbound>,
    /// Send-queue work requests in flight
    sends_in_flight: u32,
    /// Messages received
    total_recv: u64,
    /// Messages posted
    total_sent: u64,
    /// Send-queue completions consumed
    send_completions: u64,
    /// One-sided operations posted
    remote_ops: u64,
}

/// Worker resources a connection operation needs
#[derive(Debug)]
pub(crate) struct Env<'a> {
    /// The transport provider
    pub(crate) provider: &'a Arc<dyn TransportProvider>,
    /// Outstanding work contexts of the worker
    pub(crate) contexts: &'a mut WorkContextArena,
    /// Worker configuration
    pub(crate) config: &'a EngineConfig,
}

impl ConnectionCore {
    /// A connection without buffers yet
    pub(crate) fn new(endpoint: EndpointId, state: ConnectionState) -> Self {
        Self {
            endpoint,
            state,
            pool: None,
            send_buf: None,
            send_busy: false,
            one_off: HashMap::new(),
            next_one_off: 0,
            outbox: VecDeque::new(),
            sends_in_flight: 0,
            total_recv: 0,
            total_sent: 0,
            send_completions: 0,
            remote_ops: 0,
        }
    }

    /// Count one received message
    pub(crate) fn note_receive(&mut self) {
        self.total_recv = self.total_recv.saturating_add(1);
    }

    /// Messages received so far
    pub(crate) const fn total_recv(&self) -> u64 {
        self.total_recv
    }

    /// Current counters
    pub(crate) fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            total_recv: self.total_recv,
            total_sent: self.total_sent,
            send_completions: self.send_completions,
            remote_ops: self.remote_ops,
            posted_receives: self.pool.as_ref().map_or(0, BufferPool::posted),
            outstanding_sends: self.sends_in_flight,
            one_off_buffers: self.one_off.len(),
        }
    }

    /// Post queued sends while the send queue has room, preserving order
    pub(crate) fn flush(&mut self, id: ConnectionId, env: &mut Env<'_>) -> Result<()> {
        if self.state != ConnectionState::Established {
            return Ok(());
        }
        while self.sends_in_flight < env.config.max_send_wr() {
            if self.send_busy && matches!(self.outbox.front(), Some(&Outbound::Small(_))) {
                break;
            }
            let next = match self.outbox.pop_front() {
                Some(next) => next,
                None => break,
            };
            if let Err(err) = self.post_outbound(id, &next, env) {
                self.outbox.push_front(next);
                return Err(err);
            }
            match next {
                Outbound::Small(_) | Outbound::Chunk(_) => {
                    self.total_sent = self.total_sent.saturating_add(1);
                }
                Outbound::Read(_) | Outbound::Write(..) => {
                    self.remote_ops = self.remote_ops.saturating_add(1);
                }
            }
            self.sends_in_flight = self.sends_in_flight.saturating_add(1);
        }
        if !self.outbox.is_empty() {
            trace!("{} {} sends wait for the send queue", id, self.outbox.len());
        }
        Ok(())
    }

    /// Post one outbox entry
    fn post_outbound(&mut self, id: ConnectionId, next: &Outbound, env: &mut Env<'_>) -> Result<()> {
        match *next {
            Outbound::Small(ref data) => self.post_small(id, data, env),
            Outbound::Chunk(ref data) => {
                let buffer = RegisteredBuffer::from_slice(env.provider, data, send_access())?;
                self.post_one_off(id, buffer, OneOffKind::Chunk, env, SendWr::new_send)
            }
            Outbound::Read(remote) => {
                let len: usize = remote.len.cast();
                let buffer = RegisteredBuffer::register(env.provider, len, receive_access())?;
                self.post_one_off(id, buffer, OneOffKind::ReadTarget(remote), env, |sge, wr_id| {
                    SendWr::new_read(sge, wr_id, remote)
                })
            }
            Outbound::Write(ref data, remote) => {
                let buffer = RegisteredBuffer::from_slice(env.provider, data, send_access())?;
                self.post_one_off(id, buffer, OneOffKind::WriteSource(remote), env, |sge, wr_id| {
                    SendWr::new_write(sge, wr_id, remote)
                })
            }
        }
    }

    /// Copy a small message into the send buffer and post it
    fn post_small(&mut self, id: ConnectionId, data: &[u8], env: &mut Env<'_>) -> Result<()> {
        let buffer = self
            .send_buf
            .as_mut()
            .ok_or_else(|| Error::invalid_state(format!("{id} has no send buffer")))?;
        buffer.as_mut_slice()[..data.len()].copy_from_slice(data);
        let wr_id = env.contexts.insert(WorkContext {
            conn: Some(id),
            slot: BufferSlot::Send,
        });
        let wr = SendWr::new_send(buffer.sge(data.len()), wr_id);
        if let Err(err) = env.provider.post_send(self.endpoint, wr) {
            let _ctx = env.contexts.remove(wr_id);
            return Err(err.into());
        }
        self.send_busy = true;
        Ok(())
    }

    /// Keep a one-off buffer and post the send-queue request built on it
    fn post_one_off<F: FnOnce(Sge, WorkRequestId) -> SendWr>(
        &mut self,
        id: ConnectionId,
        buffer: RegisteredBuffer,
        kind: OneOffKind,
        env: &mut Env<'_>,
        make_wr: F,
    ) -> Result<()> {
        let key = self.next_one_off;
        self.next_one_off = self.next_one_off.wrapping_add(1);
        let wr_id = env.contexts.insert(WorkContext {
            conn: Some(id),
            slot: BufferSlot::OneOff(key),
        });
        let wr = make_wr(buffer.full_sge(), wr_id);
        let _old = self.one_off.insert(key, OneOff { buffer, kind });
        if let Err(err) = env.provider.post_send(self.endpoint, wr) {
            let _ctx = env.contexts.remove(wr_id);
            let _buffer = self.one_off.remove(&key);
            return Err(err.into());
        }
        Ok(())
    }

    /// Account a send-queue completion, returning the one-off buffer it used
    pub(crate) fn complete_send(&mut self, slot: BufferSlot) -> Option<OneOff> {
        self.sends_in_flight = self.sends_in_flight.saturating_sub(1);
        self.send_completions = self.send_completions.saturating_add(1);
        match slot {
            BufferSlot::Send => {
                self.send_busy = false;
                None
            }
            BufferSlot::OneOff(key) => self.one_off.remove(&key),
            BufferSlot::Pool(_) | BufferSlot::Shared(_) => {
                warn!("receive slot {:?} completed on the send queue", slot);
                None
            }
        }
    }

    /// Ask the provider to take an established connection down
    pub(crate) fn begin_disconnect(&mut self, provider: &dyn TransportProvider) -> Result<()> {
        if self.state != ConnectionState::Established {
            return Ok(());
        }
        self.state = ConnectionState::Disconnecting;
        if let Err(err) = provider.disconnect(self.endpoint) {
            self.state = ConnectionState::Closed;
            return Err(err.into());
        }
        Ok(())
    }

    /// Release every buffer and destroy the endpoint.
    ///
    /// Order: receive pool, one-off buffers, queued sends, send buffer, endpoint.
    pub(crate) fn release(
        &mut self,
        id: ConnectionId,
        provider: &dyn TransportProvider,
        contexts: &mut WorkContextArena,
    ) -> ConnectionStats {
        let stats = self.stats();
        if let Some(mut pool) = self.pool.take() {
            pool.release_all();
        }
        self.one_off.clear();
        self.outbox.clear();
        self.send_buf = None;
        let withdrawn = contexts.remove_connection(id);
        log_provider_err(provider.destroy_id(self.endpoint), "destroy endpoint on release");
        self.state = ConnectionState::Closed;
        debug!(
            "{} on {} released, total_recv {}, {} contexts withdrawn",
            id, self.endpoint, self.total_recv, withdrawn
        );
        stats
    }
}

/// A connection: what it owns plus its handler
#[derive(Debug)]
pub(crate) struct Connection {
    /// Owned state
    pub(crate) core: ConnectionCore,
    /// Application callbacks
    pub(crate) handler: Box<dyn ConnectionHandler>,
}

/// The view of a connection handed to its handler
#[derive(Debug)]
pub struct ConnectionCtx<'a> {
    /// Id of the connection
    id: ConnectionId,
    /// The connection
    core: &'a mut ConnectionCore,
    /// Worker resources
    env: Env<'a>,
}

impl<'a> ConnectionCtx<'a> {
    /// Borrow a connection for one callback
    pub(crate) fn new(id: ConnectionId, core: &'a mut ConnectionCore, env: Env<'a>) -> Self {
        Self { id, core, env }
    }

    /// Id of the connection
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Lifecycle state
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.core.state
    }

    /// The endpoint of the connection
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> EndpointId {
        self.core.endpoint
    }

    /// Messages received so far
    #[inline]
    #[must_use]
    pub fn total_recv(&self) -> u64 {
        self.core.total_recv()
    }

    /// Current counters
    #[inline]
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.core.stats()
    }

    /// Queue operations are accepted before and while the connection is established
    fn ensure_open(&self) -> Result<()> {
        match self.core.state {
            ConnectionState::Resolving | ConnectionState::Connecting | ConnectionState::Established => Ok(()),
            ConnectionState::Disconnecting | ConnectionState::Closed => Err(Error::invalid_state(format!(
                "{} is {:?}",
                self.id, self.core.state
            ))),
        }
    }

    /// Post what the send queue has room for
    fn flush(&mut self) -> Result<()> {
        self.core.flush(self.id, &mut self.env)
    }

    /// Send a message that fits the dedicated send buffer
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let capacity = self.env.config.send_buffer_size();
        if data.len() > capacity {
            return Err(Error::Resource(format!(
                "message of {} bytes exceeds the send buffer of {} bytes",
                data.len(),
                capacity
            )));
        }
        self.core.outbox.push_back(Outbound::Small(data.to_vec()));
        self.flush()
    }

    /// Send `payload` framed and split into segments, returning the number of segments
    pub fn send_chunked(&mut self, payload: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let segments = split_framed(payload, self.env.config.chunk_size())?;
        let count = segments.len();
        self.core
            .outbox
            .extend(segments.into_iter().map(Outbound::Chunk));
        self.flush()?;
        Ok(count)
    }

    /// Read the whole `remote` region into a fresh local buffer.
    ///
    /// The handler gets exactly `remote.len` bytes with `Completion::RemoteRead`.
    pub fn read_remote(&mut self, remote: RemoteDescriptor) -> Result<()> {
        self.ensure_open()?;
        if remote.len == 0 {
            return Err(Error::protocol("remote read of an empty region"));
        }
        self.core.outbox.push_back(Outbound::Read(remote));
        self.flush()
    }

    /// Write at most `remote.len` bytes of `data` into the `remote` region
    pub fn write_remote(&mut self, data: &[u8], remote: RemoteDescriptor) -> Result<()> {
        self.ensure_open()?;
        let limit: usize = remote.len.cast();
        let len = data.len().min(limit);
        if len < data.len() {
            debug!(
                "{} write of {} bytes truncated to the {} bytes of the region",
                self.id,
                data.len(),
                len
            );
        }
        self.core
            .outbox
            .push_back(Outbound::Write(data[..len].to_vec(), remote));
        self.flush()
    }

    /// Keep an exposed buffer
    fn keep_exposed(&mut self, buffer: RegisteredBuffer) -> RemoteDescriptor {
        let descriptor = buffer.descriptor();
        let key = self.core.next_one_off;
        self.core.next_one_off = self.core.next_one_off.wrapping_add(1);
        let _old = self.core.one_off.insert(
            key,
            OneOff {
                buffer,
                kind: OneOffKind::Exposed,
            },
        );
        descriptor
    }

    /// Register a copy of `data` the peer may read, until withdrawn or torn down
    pub fn expose_for_read(&mut self, data: &[u8]) -> Result<RemoteDescriptor> {
        let buffer = RegisteredBuffer::from_slice(self.env.provider, data, exposed_read_access())?;
        Ok(self.keep_exposed(buffer))
    }

    /// Register `len` zeroed bytes the peer may write, until withdrawn or torn down
    pub fn expose_for_write(&mut self, len: usize) -> Result<RemoteDescriptor> {
        let buffer = RegisteredBuffer::register(self.env.provider, len, exposed_write_access())?;
        Ok(self.keep_exposed(buffer))
    }

    /// Key of the exposed buffer behind `descriptor`
    fn exposed_key(&self, descriptor: &RemoteDescriptor) -> Option<u64> {
        self.core
            .one_off
            .iter()
            .find(|&(_, one_off)| {
                one_off.kind == OneOffKind::Exposed
                    && one_off.buffer.descriptor().addr == descriptor.addr
                    && one_off.buffer.descriptor().rkey == descriptor.rkey
            })
            .map(|(&key, _)| key)
    }

    /// Contents of an exposed buffer
    #[must_use]
    pub fn exposed(&self, descriptor: &RemoteDescriptor) -> Option<&[u8]> {
        let key = self.exposed_key(descriptor)?;
        self.core.one_off.get(&key).map(|one_off| one_off.buffer.as_slice())
    }

    /// Deregister and free an exposed buffer, returning whether it existed
    pub fn withdraw(&mut self, descriptor: &RemoteDescriptor) -> bool {
        self.exposed_key(descriptor)
            .and_then(|key| self.core.one_off.remove(&key))
            .is_some()
    }

    /// Start taking the connection down.
    ///
    /// Outstanding work is flushed, the worker releases the connection once the
    /// disconnect event arrived.
    pub fn disconnect(&mut self) -> Result<()> {
        self.core.begin_disconnect(self.env.provider.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer_pool::PostTarget,
        config::EngineConfigBuilder,
        provider::{loopback::LoopbackProvider, CmEventKind, QpInitAttr},
    };
    use std::time::Duration;

    /// A client endpoint connected to a server endpoint that has `recvs` receives posted
    fn connected(
        provider: &Arc<dyn TransportProvider>,
        contexts: &mut WorkContextArena,
        recvs: usize,
    ) -> (EndpointId, EndpointId, BufferPool) {
        let ch = provider.create_cm_channel().unwrap();
        let cq = provider.create_cq(64).unwrap();
        let attr = QpInitAttr {
            cq,
            srq: None,
            max_send_wr: 8,
            max_recv_wr: 16,
        };
        let addr = "10.0.0.1:7000".parse().unwrap();
        let listener = provider.create_id(ch).unwrap();
        provider.listen(listener, addr, 8).unwrap();
        let client = provider.create_id(ch).unwrap();
        provider.resolve_addr(client, addr, Duration::from_millis(100)).unwrap();
        provider.resolve_route(client, Duration::from_millis(100)).unwrap();
        provider.create_qp(client, &attr).unwrap();
        provider.connect(client).unwrap();
        let request = provider.get_cm_event(ch).unwrap().unwrap();
        assert_eq!(request.kind, CmEventKind::ConnectRequest);
        let server = request.endpoint;
        provider.create_qp(server, &attr).unwrap();
        let pool = BufferPool::acquire_all(provider, contexts, None, PostTarget::Endpoint(server), recvs, 64)
            .unwrap();
        provider.accept(server).unwrap();
        (client, server, pool)
    }

    #[test]
    fn outbox_respects_the_send_queue_depth() {
        let loopback = Arc::new(LoopbackProvider::new());
        let provider: Arc<dyn TransportProvider> = Arc::<LoopbackProvider>::clone(&loopback);
        let mut contexts = WorkContextArena::default();
        let (client, server, _pool) = connected(&provider, &mut contexts, 4);
        let config = EngineConfigBuilder::default()
            .max_send_wr(2_u32)
            .chunk_size(8_usize)
            .build()
            .unwrap();
        let id = ConnectionId(Handle::from_u64(0));
        let mut core = ConnectionCore::new(client, ConnectionState::Established);
        core.send_buf = Some(RegisteredBuffer::register(&provider, 128, send_access()).unwrap());

        let mut ctx = ConnectionCtx::new(
            id,
            &mut core,
            Env {
                provider: &provider,
                contexts: &mut contexts,
                config: &config,
            },
        );
        // 13 bytes framed to 18: segments of 8, 8 and 2
        assert_eq!(ctx.send_chunked(b"0123456789abc").unwrap(), 3);
        assert_eq!(ctx.stats().outstanding_sends, 2);
        assert_eq!(ctx.stats().one_off_buffers, 2);
        assert_eq!(loopback.posted_receives(server), 2);

        assert!(core.complete_send(BufferSlot::OneOff(0)).is_some());
        let mut env = Env {
            provider: &provider,
            contexts: &mut contexts,
            config: &config,
        };
        core.flush(id, &mut env).unwrap();
        assert_eq!(core.stats().total_sent, 3);
        assert_eq!(core.stats().outstanding_sends, 2);
        assert_eq!(loopback.posted_receives(server), 1);
    }

    #[test]
    fn closed_connection_refuses_sends() {
        let provider: Arc<dyn TransportProvider> = Arc::new(LoopbackProvider::new());
        let mut contexts = WorkContextArena::default();
        let config = EngineConfig::default();
        let mut core = ConnectionCore::new(EndpointId(1), ConnectionState::Closed);
        let mut ctx = ConnectionCtx::new(
            ConnectionId(Handle::from_u64(7)),
            &mut core,
            Env {
                provider: &provider,
                contexts: &mut contexts,
                config: &config,
            },
        );
        assert_eq!(ctx.send(b"get foo\r\n").unwrap_err().kind(), crate::ErrorKind::InvalidState);
        let too_big = vec![0_u8; 129];
        let mut open = ConnectionCore::new(EndpointId(1), ConnectionState::Connecting);
        let mut ctx = ConnectionCtx::new(
            ConnectionId(Handle::from_u64(8)),
            &mut open,
            Env {
                provider: &provider,
                contexts: &mut contexts,
                config: &config,
            },
        );
        assert_eq!(ctx.send(&too_big).unwrap_err().kind(), crate::ErrorKind::Resource);
        // queued until the connection is established
        ctx.send(b"get foo\r\n").unwrap();
        assert_eq!(ctx.stats().total_sent, 0);
    }
}
