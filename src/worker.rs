use crate::{
    access::{receive_access, send_access},
    arena::Arena,
    buffer_pool::{BufferPool, PostTarget},
    completion_queue::{WCError, WcOpcode, WorkCompletion},
    config::EngineConfig,
    connection::{
        Connection, ConnectionCore, ConnectionCtx, ConnectionId, ConnectionState, ConnectionStats, Env,
        OneOffKind,
    },
    dispatcher::{
        build_trigger, wait_trigger, AsyncFdTrigger, CompletionDispatcher, DispatchStats, ManualTrigger,
        PollingTrigger, PollingTriggerType,
    },
    error::{Error, ErrorKind, Result},
    error_utilities::{log_provider_err, log_ret},
    handler::{Completion, ConnectionHandler, HandlerFactory},
    memory_region::{MrAccess, RegisteredBuffer},
    provider::{CmChannelId, CmEvent, CmEventKind, CqId, EndpointId, QpInitAttr, SrqId, TransportProvider},
    registry::SharedRegistry,
    work_context::{BufferSlot, WorkContextArena},
};
use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    sync::Arc,
    thread::{self, JoinHandle},
};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tracing::{debug, error, info, trace, warn};

/// Capacity of the manual trigger channel
const MANUAL_TRIGGER_CAPACITY: usize = 16;

/// The listening endpoint and the handler factory of its connections
struct Listener {
    /// Listening endpoint
    endpoint: EndpointId,
    /// Address listened on
    addr: SocketAddr,
    /// Builds the handler of every accepted connection
    factory: HandlerFactory,
}

impl fmt::Debug for Listener {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("endpoint", &self.endpoint)
            .field("addr", &self.addr)
            .finish()
    }
}

/// Everything one dispatcher loop owns.
///
/// A worker holds one provider handle, one completion queue (plus an optional shared
/// receive queue with its pool) and the connections created through it. It is driven
/// from one thread; workers share nothing but, optionally, the `SharedRegistry`.
#[derive(Debug)]
pub struct WorkerContext {
    /// The transport provider
    provider: Arc<dyn TransportProvider>,
    /// Configuration
    config: EngineConfig,
    /// Connection-manager event channel
    cm_channel: CmChannelId,
    /// Completion queue of every connection
    cq: CqId,
    /// Shared receive queue, if configured
    srq: Option<SrqId>,
    /// Pool posted to the shared receive queue
    shared_pool: Option<BufferPool>,
    /// Live connections
    connections: Arena<Connection>,
    /// Endpoint id to connection, for connection-manager events and shared receives
    registry: SharedRegistry<ConnectionId>,
    /// Outstanding work requests
    contexts: WorkContextArena,
    /// Consumes completion events and completions
    dispatcher: CompletionDispatcher,
    /// Listening endpoint, if any
    listener: Option<Listener>,
    /// Sender side of the manual trigger
    manual_tx: Option<Sender<()>>,
    /// Receiver side of the manual trigger, taken by `run_until`
    manual_rx: Option<Receiver<()>>,
}

impl WorkerContext {
    /// Create a worker with its own registry
    pub fn new(provider: Arc<dyn TransportProvider>, config: EngineConfig) -> Result<Self> {
        let registry = SharedRegistry::with_expected(config.expected_connections())?;
        Self::with_registry(provider, config, registry)
    }

    /// Create a worker that records its connections in `registry`
    pub fn with_registry(
        provider: Arc<dyn TransportProvider>,
        config: EngineConfig,
        registry: SharedRegistry<ConnectionId>,
    ) -> Result<Self> {
        let cm_channel = provider.create_cm_channel()?;
        let cq = provider.create_cq(config.cq_size())?;
        let cq_owner = Arc::clone(&provider);
        let cq = scopeguard::guard(cq, move |cq| {
            log_provider_err(cq_owner.destroy_cq(cq), "destroy cq of a failed worker");
        });

        let dispatcher = CompletionDispatcher::new(*cq, &config);
        dispatcher.rearm(provider.as_ref())?;

        let mut contexts = WorkContextArena::default();
        let (srq, shared_pool) = if config.shared_receive_queue() {
            let srq = provider.create_srq(config.srq_size())?;
            let pool = BufferPool::acquire_all(
                &provider,
                &mut contexts,
                None,
                PostTarget::Shared(srq),
                config.pool_size(),
                config.buffer_size(),
            );
            match pool {
                Ok(pool) => (Some(srq), Some(pool)),
                Err(err) => {
                    log_provider_err(provider.destroy_srq(srq), "destroy srq of a failed worker");
                    return Err(err);
                }
            }
        } else {
            (None, None)
        };

        let (manual_tx, manual_rx) = match config.polling_trigger() {
            PollingTriggerType::Manual => {
                let (tx, rx) = channel(MANUAL_TRIGGER_CAPACITY);
                (Some(tx), Some(rx))
            }
            PollingTriggerType::Automatic | PollingTriggerType::BusyPoll => (None, None),
        };

        let cq = scopeguard::ScopeGuard::into_inner(cq);
        debug!("worker on {:?} ready, shared receive queue {:?}", cq, srq);
        Ok(Self {
            provider,
            config,
            cm_channel,
            cq,
            srq,
            shared_pool,
            connections: Arena::default(),
            registry,
            contexts,
            dispatcher,
            listener: None,
            manual_tx,
            manual_rx,
        })
    }

    /// Queue pair attributes of every connection
    fn qp_attr(&self) -> QpInitAttr {
        QpInitAttr {
            cq: self.cq,
            srq: self.srq,
            max_send_wr: self.config.max_send_wr(),
            max_recv_wr: self.config.max_recv_wr(),
        }
    }

    /// Listen on `addr`; every accepted connection gets a handler from `factory`
    pub fn listen(&mut self, addr: SocketAddr, factory: HandlerFactory) -> Result<EndpointId> {
        if let Some(ref listener) = self.listener {
            return Err(Error::invalid_state(format!(
                "worker already listens on {}",
                listener.addr
            )));
        }
        let endpoint = self.provider.create_id(self.cm_channel)?;
        if let Err(err) = self.provider.listen(endpoint, addr, self.config.backlog()) {
            log_provider_err(self.provider.destroy_id(endpoint), "destroy failed listener");
            return log_ret(Err(err.into()), "listen");
        }
        info!("listening on {} with {}", addr, endpoint);
        self.listener = Some(Listener {
            endpoint,
            addr,
            factory,
        });
        Ok(endpoint)
    }

    /// Connect to `addr`.
    ///
    /// Resolution is bounded by the configured timeout. The connection is usable once
    /// `process_cm_events` saw it established; sends issued earlier are queued.
    pub fn connect(&mut self, addr: SocketAddr, handler: Box<dyn ConnectionHandler>) -> Result<ConnectionId> {
        let endpoint = self.provider.create_id(self.cm_channel)?;
        let id = ConnectionId(self.connections.insert(Connection {
            core: ConnectionCore::new(endpoint, ConnectionState::Resolving),
            handler,
        }));
        let timeout = self.config.resolve_timeout();
        let resolved = self
            .provider
            .resolve_addr(endpoint, addr, timeout)
            .and_then(|()| self.provider.resolve_route(endpoint, timeout));
        if let Err(err) = resolved {
            self.close(id);
            return log_ret(Err(Error::Resolution(format!("{addr}: {err}"))), "connect");
        }
        if let Some(conn) = self.connections.get_mut(id.0) {
            conn.core.state = ConnectionState::Connecting;
        }
        let attr = self.qp_attr();
        let setup = self
            .provider
            .create_qp(endpoint, &attr)
            .map_err(Error::from)
            .and_then(|()| self.provision(id));
        if let Err(err) = setup {
            self.close(id);
            return log_ret(Err(err), "connect");
        }
        let _old = self.registry.insert(endpoint.0, id);
        if let Err(err) = self.provider.connect(endpoint) {
            self.close(id);
            return log_ret(Err(Error::Connect(format!("{addr}: {err}"))), "connect");
        }
        debug!("{} connecting to {} from {}", id, addr, endpoint);
        Ok(id)
    }

    /// Register and post the receive pool and the send buffer of a connection
    fn provision(&mut self, id: ConnectionId) -> Result<()> {
        let conn = self
            .connections
            .get_mut(id.0)
            .ok_or_else(|| Error::invalid_state(format!("{id} is unknown")))?;
        if self.srq.is_none() {
            conn.core.pool = Some(BufferPool::acquire_all(
                &self.provider,
                &mut self.contexts,
                Some(id),
                PostTarget::Endpoint(conn.core.endpoint),
                self.config.pool_size(),
                self.config.buffer_size(),
            )?);
        }
        conn.core.send_buf = Some(RegisteredBuffer::register(
            &self.provider,
            self.config.send_buffer_size(),
            send_access(),
        )?);
        Ok(())
    }

    /// Handle every pending connection-manager event, returning how many there were
    pub fn process_cm_events(&mut self) -> Result<usize> {
        let mut handled = 0_usize;
        while let Some(event) = self.provider.get_cm_event(self.cm_channel)? {
            trace!("cm event {:?}", event);
            self.on_cm_event(event)?;
            handled = handled.saturating_add(1);
        }
        self.reap();
        Ok(handled)
    }

    /// Dispatch one connection-manager event
    fn on_cm_event(&mut self, event: CmEvent) -> Result<()> {
        match event.kind {
            CmEventKind::ConnectRequest => self.on_connect_request(event.endpoint),
            CmEventKind::Established => {
                self.on_established(event.endpoint);
                Ok(())
            }
            CmEventKind::Disconnected => {
                if let Some(id) = self.lookup(event.endpoint) {
                    if let Some(conn) = self.connections.get_mut(id.0) {
                        conn.core.state = ConnectionState::Disconnecting;
                    }
                    // flushed work first, then the buffers
                    let _flushed = self.drain()?;
                    self.close(id);
                }
                Ok(())
            }
            CmEventKind::AddrError
            | CmEventKind::RouteError
            | CmEventKind::ConnectError
            | CmEventKind::Unreachable
            | CmEventKind::Rejected => {
                warn!("{:?} on {}", event.kind, event.endpoint);
                if let Some(id) = self.lookup(event.endpoint) {
                    self.close(id);
                }
                Ok(())
            }
        }
    }

    /// Connection of an endpoint, if it belongs to this worker
    fn lookup(&self, endpoint: EndpointId) -> Option<ConnectionId> {
        match self.registry.lookup(endpoint.0) {
            Some(id) if self.connections.get(id.0).is_some() => Some(id),
            Some(id) => {
                debug!("{} of {} is not owned by this worker", id, endpoint);
                None
            }
            None => {
                debug!("no connection for {}", endpoint);
                None
            }
        }
    }

    /// Set up and accept a connect request
    fn on_connect_request(&mut self, endpoint: EndpointId) -> Result<()> {
        let attr = self.qp_attr();
        let listener = match self.listener.as_mut() {
            Some(listener) => listener,
            None => {
                warn!("connect request on {} without a listener", endpoint);
                log_provider_err(self.provider.reject(endpoint), "reject without listener");
                return Ok(());
            }
        };
        if let Err(err) = self.provider.create_qp(endpoint, &attr) {
            error!("failed to create the queue pair of {}: {:?}", endpoint, err);
            log_provider_err(self.provider.reject(endpoint), "reject after create_qp");
            return Ok(());
        }
        let handle = self.connections.insert_with(|handle| Connection {
            core: ConnectionCore::new(endpoint, ConnectionState::Connecting),
            handler: (listener.factory)(ConnectionId(handle)),
        });
        let id = ConnectionId(handle);
        if let Err(err) = self.provision(id) {
            error!("failed to provision {}: {}", id, err);
            log_provider_err(self.provider.reject(endpoint), "reject after provisioning");
            // a rejected endpoint is destroyed by the provider, dropping frees the buffers
            let _withdrawn = self.contexts.remove_connection(id);
            let _dropped = self.connections.remove(id.0);
            return Ok(());
        }
        let _old = self.registry.insert(endpoint.0, id);
        if let Err(err) = self.provider.accept(endpoint) {
            error!("failed to accept {}: {:?}", endpoint, err);
            self.close(id);
            return Ok(());
        }
        debug!("{} accepted on {}", id, endpoint);
        Ok(())
    }

    /// The connection of `endpoint` became usable
    fn on_established(&mut self, endpoint: EndpointId) {
        let id = match self.lookup(endpoint) {
            Some(id) => id,
            None => return,
        };
        let conn = match self.connections.get_mut(id.0) {
            Some(conn) => conn,
            None => return,
        };
        if conn.core.state != ConnectionState::Connecting {
            warn!("{} established in state {:?}", id, conn.core.state);
            return;
        }
        conn.core.state = ConnectionState::Established;
        let Connection {
            ref mut core,
            ref mut handler,
        } = *conn;
        let mut ctx = ConnectionCtx::new(
            id,
            core,
            Env {
                provider: &self.provider,
                contexts: &mut self.contexts,
                config: &self.config,
            },
        );
        let result = handler.on_established(&mut ctx);
        settle(id, core, result, self.provider.as_ref());
        let mut env = Env {
            provider: &self.provider,
            contexts: &mut self.contexts,
            config: &self.config,
        };
        if let Err(err) = core.flush(id, &mut env) {
            error!("{} failed to flush queued sends: {}", id, err);
            shut(id, core, self.provider.as_ref());
        }
        info!("{} established on {}", id, endpoint);
    }

    /// Route every queued completion
    fn drain(&mut self) -> Result<usize> {
        let Self {
            ref provider,
            ref config,
            ref mut contexts,
            ref mut connections,
            ref mut shared_pool,
            ref registry,
            ref mut dispatcher,
            ..
        } = *self;
        let mut router = Router {
            provider,
            config,
            contexts,
            connections,
            shared_pool,
            registry,
        };
        dispatcher.drain(provider.as_ref(), |wc| router.route(wc))
    }

    /// Consume pending channel events, re-arm, then drain the completion queue.
    ///
    /// Returns the number of completions routed.
    pub fn dispatch_ready(&mut self) -> Result<usize> {
        while self.dispatcher.take_event(self.provider.as_ref())? {}
        self.dispatcher.rearm(self.provider.as_ref())?;
        let routed = self.drain()?;
        self.reap();
        Ok(routed)
    }

    /// Re-arm and drain without waiting for a channel event
    pub fn poll_completions(&mut self) -> Result<usize> {
        self.dispatcher.rearm(self.provider.as_ref())?;
        let routed = self.drain()?;
        self.reap();
        Ok(routed)
    }

    /// Run the dispatcher loop until `stop` completes.
    ///
    /// Every wait is bounded by the configured `cc_event_timeout`, after which the
    /// worker polls protectively. Per-completion failures never end the loop.
    pub async fn run_until<F: Future<Output = ()>>(&mut self, stop: F) -> Result<()> {
        let cc_event_timeout = self.config.cc_event_timeout();
        let mut cq_trigger = build_trigger(
            self.config.polling_trigger(),
            self.provider.cq_channel_fd(self.cq),
            self.manual_rx.take(),
        )?;
        let mut cm_trigger: Box<dyn PollingTrigger> = match self.provider.cm_channel_fd(self.cm_channel) {
            Some(fd) => Box::new(AsyncFdTrigger::new(fd)?),
            None => build_trigger(PollingTriggerType::Automatic, None, None)?,
        };
        tokio::pin!(stop);
        let _events = self.process_cm_events()?;
        let _routed = self.dispatch_ready()?;
        loop {
            tokio::select! {
                () = &mut stop => break,
                res = wait_trigger(cm_trigger.as_mut(), cc_event_timeout) => res?,
                res = wait_trigger(cq_trigger.as_mut(), cc_event_timeout) => res?,
            }
            let _events = self.process_cm_events()?;
            let _routed = self.dispatch_ready()?;
        }
        self.dispatcher.flush_acks(self.provider.as_ref());
        debug!("dispatcher loop stopped, {:?}", self.dispatcher.stats());
        Ok(())
    }

    /// Send a message through the dedicated send buffer of `id`
    pub fn send(&mut self, id: ConnectionId, data: &[u8]) -> Result<()> {
        self.with_connection(id, |ctx| ctx.send(data))
    }

    /// Send `payload` framed and chunked, returning the number of segments.
    ///
    /// Segments are `EngineConfig::chunk_size` bytes, the peer must post receive buffers
    /// at least that large.
    pub fn send_chunked(&mut self, id: ConnectionId, payload: &[u8]) -> Result<usize> {
        self.with_connection(id, |ctx| ctx.send_chunked(payload))
    }

    /// Run `f` on the context of connection `id`
    pub fn with_connection<R, F>(&mut self, id: ConnectionId, f: F) -> Result<R>
    where
        F: FnOnce(&mut ConnectionCtx<'_>) -> Result<R>,
    {
        let conn = self
            .connections
            .get_mut(id.0)
            .ok_or_else(|| Error::invalid_state(format!("{id} is unknown")))?;
        let mut ctx = ConnectionCtx::new(
            id,
            &mut conn.core,
            Env {
                provider: &self.provider,
                contexts: &mut self.contexts,
                config: &self.config,
            },
        );
        let ret = f(&mut ctx);
        self.reap();
        ret
    }

    /// Start taking connection `id` down; it is released once the provider confirmed
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<()> {
        let conn = self
            .connections
            .get_mut(id.0)
            .ok_or_else(|| Error::invalid_state(format!("{id} is unknown")))?;
        let ret = match conn.core.state {
            ConnectionState::Established => conn.core.begin_disconnect(self.provider.as_ref()),
            ConnectionState::Resolving | ConnectionState::Connecting => {
                conn.core.state = ConnectionState::Closed;
                Ok(())
            }
            ConnectionState::Disconnecting | ConnectionState::Closed => Ok(()),
        };
        self.reap();
        log_ret(ret, "disconnect")
    }

    /// Release connections that reached `Closed`
    fn reap(&mut self) {
        let closed: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|&(_, conn)| conn.core.state == ConnectionState::Closed)
            .map(|(handle, _)| ConnectionId(handle))
            .collect();
        for id in closed {
            self.close(id);
        }
    }

    /// Release connection `id` now
    fn close(&mut self, id: ConnectionId) {
        if let Some(mut conn) = self.connections.remove(id.0) {
            let endpoint = conn.core.endpoint;
            conn.handler.on_disconnected(&conn.core.stats());
            if self.registry.lookup(endpoint.0) == Some(id) {
                let _removed = self.registry.remove(endpoint.0);
            }
            let _stats = conn.core.release(id, self.provider.as_ref(), &mut self.contexts);
        }
    }

    /// State of connection `id`, `None` once released
    #[inline]
    #[must_use]
    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(id.0).map(|conn| conn.core.state)
    }

    /// Counters of connection `id`
    #[inline]
    #[must_use]
    pub fn connection_stats(&self, id: ConnectionId) -> Option<ConnectionStats> {
        self.connections.get(id.0).map(|conn| conn.core.stats())
    }

    /// The pool connection `id` receives into, its own or the shared one
    #[inline]
    #[must_use]
    pub fn receive_pool(&self, id: ConnectionId) -> Option<&BufferPool> {
        let conn = self.connections.get(id.0)?;
        conn.core.pool.as_ref().or(self.shared_pool.as_ref())
    }

    /// Receives currently posted for connection `id`
    #[inline]
    #[must_use]
    pub fn posted_receives(&self, id: ConnectionId) -> Option<usize> {
        self.receive_pool(id).map(BufferPool::posted)
    }

    /// Largest receive buffer available to connection `id`
    #[inline]
    #[must_use]
    pub fn largest_receive_buffer(&self, id: ConnectionId) -> Option<usize> {
        self.receive_pool(id).map(BufferPool::largest_buffer)
    }

    /// The shared receive pool, if configured
    #[inline]
    #[must_use]
    pub fn shared_pool(&self) -> Option<&BufferPool> {
        self.shared_pool.as_ref()
    }

    /// Number of live connections
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Ids of the live connections
    pub fn connection_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.iter().map(|(handle, _)| ConnectionId(handle))
    }

    /// Number of outstanding work requests
    #[inline]
    #[must_use]
    pub fn outstanding_work(&self) -> usize {
        self.contexts.len()
    }

    /// The endpoint registry
    #[inline]
    #[must_use]
    pub const fn registry(&self) -> &SharedRegistry<ConnectionId> {
        &self.registry
    }

    /// Dispatcher counters
    #[inline]
    #[must_use]
    pub const fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// The trigger to pull with `PollingTriggerType::Manual`
    #[inline]
    #[must_use]
    pub fn manual_trigger(&self) -> Option<ManualTrigger> {
        self.manual_tx.clone().map(ManualTrigger)
    }

    /// The configuration
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared receive queue, if configured
    #[inline]
    #[must_use]
    pub const fn srq(&self) -> Option<SrqId> {
        self.srq
    }

    /// The completion queue
    #[inline]
    #[must_use]
    pub const fn cq(&self) -> CqId {
        self.dispatcher.cq()
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|(handle, _)| ConnectionId(handle))
            .collect();
        for id in ids {
            self.close(id);
        }
        if let Some(mut pool) = self.shared_pool.take() {
            pool.release_all();
        }
        if let Some(listener) = self.listener.take() {
            log_provider_err(self.provider.destroy_id(listener.endpoint), "destroy listener");
        }
        self.dispatcher.flush_acks(self.provider.as_ref());
        if let Some(srq) = self.srq.take() {
            log_provider_err(self.provider.destroy_srq(srq), "destroy srq");
        }
        log_provider_err(self.provider.destroy_cq(self.cq), "destroy cq");
    }
}

/// Handle a handler result: protocol errors drop the message, others disconnect
fn settle(id: ConnectionId, core: &mut ConnectionCore, result: Result<()>, provider: &dyn TransportProvider) {
    match result {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::Protocol => {
            warn!("{} dropped a message: {}", id, err);
        }
        Err(err) => {
            error!("{} handler failed: {}", id, err);
            shut(id, core, provider);
        }
    }
}

/// Take a connection down after a failure
fn shut(id: ConnectionId, core: &mut ConnectionCore, provider: &dyn TransportProvider) {
    match core.state {
        ConnectionState::Established => {
            if let Err(err) = core.begin_disconnect(provider) {
                error!("{} failed to disconnect: {}", id, err);
            }
        }
        ConnectionState::Resolving | ConnectionState::Connecting => core.state = ConnectionState::Closed,
        ConnectionState::Disconnecting | ConnectionState::Closed => {}
    }
}

/// Split borrows of a worker while its completions are routed
struct Router<'a> {
    /// The transport provider
    provider: &'a Arc<dyn TransportProvider>,
    /// Configuration
    config: &'a EngineConfig,
    /// Outstanding work requests
    contexts: &'a mut WorkContextArena,
    /// Live connections
    connections: &'a mut Arena<Connection>,
    /// Pool of the shared receive queue
    shared_pool: &'a mut Option<BufferPool>,
    /// Endpoint id to connection
    registry: &'a SharedRegistry<ConnectionId>,
}

impl Router<'_> {
    /// Route one completion to the connection that posted it
    fn route(&mut self, wc: WorkCompletion) {
        let wr_id = wc.wr_id();
        let ctx = match self.contexts.remove(wr_id) {
            Some(ctx) => ctx,
            None => {
                debug!("completion of withdrawn {:?} ignored: {:?}", wr_id, wc);
                return;
            }
        };
        let conn = ctx.conn.or_else(|| self.registry.lookup(wc.qp_num()));
        match ctx.slot {
            BufferSlot::Pool(index) => self.on_receive(wc, conn, index, false),
            BufferSlot::Shared(index) => self.on_receive(wc, conn, index, true),
            BufferSlot::Send | BufferSlot::OneOff(_) => self.on_send_queue(wc, conn, ctx.slot),
        }
    }

    /// The pool a receive buffer belongs to
    fn pool(&mut self, conn: Option<ConnectionId>, shared: bool) -> Option<&mut BufferPool> {
        if shared {
            return self.shared_pool.as_mut();
        }
        conn.and_then(|id| self.connections.get_mut(id.0))
            .and_then(|conn| conn.core.pool.as_mut())
    }

    /// Whether receives may still be posted for `conn`
    fn accepting(&self, conn: Option<ConnectionId>) -> bool {
        conn.and_then(|id| self.connections.get(id.0))
            .map_or(false, |conn| {
                matches!(
                    conn.core.state,
                    ConnectionState::Connecting | ConnectionState::Established
                )
            })
    }

    /// A receive completed, successfully or not
    fn on_receive(&mut self, wc: WorkCompletion, conn: Option<ConnectionId>, index: usize, shared: bool) {
        let buffer = match self.pool(conn, shared).and_then(|pool| pool.take(index)) {
            Some(buffer) => buffer,
            None => {
                warn!("receive slot {} of {:?} holds no buffer", index, conn);
                return;
            }
        };
        let (buffer, grown) = match wc.result() {
            Ok(len) => {
                self.deliver(conn, &buffer, len);
                (buffer, false)
            }
            Err(WCError::LocLenErr) => (self.grow(conn, shared, wc.byte_len(), buffer), true),
            Err(WCError::WrFlushErr) => {
                self.flushed(conn, "receive");
                (buffer, false)
            }
            Err(err) => {
                error!("receive on {:?} failed: {}", conn, err);
                self.fail(conn);
                (buffer, false)
            }
        };
        self.give_back(conn, index, shared, buffer, grown);
    }

    /// Hand a received message to its handler
    fn deliver(&mut self, conn: Option<ConnectionId>, buffer: &RegisteredBuffer, len: usize) {
        let (id, connection) = match conn.and_then(|id| self.connections.get_mut(id.0).map(|c| (id, c))) {
            Some(found) => found,
            None => {
                warn!("{} bytes received for no connection, dropped", len);
                return;
            }
        };
        let Connection {
            ref mut core,
            ref mut handler,
        } = *connection;
        core.note_receive();
        let data = &buffer.as_slice()[..len.min(buffer.length())];
        let mut ctx = ConnectionCtx::new(
            id,
            core,
            Env {
                provider: self.provider,
                contexts: &mut *self.contexts,
                config: self.config,
            },
        );
        let result = handler.on_completion(&mut ctx, Completion::Receive { data });
        settle(id, core, result, self.provider.as_ref());
    }

    /// A message did not fit its receive buffer: the message is lost and a larger buffer
    /// takes the place of the small one in the same slot.
    ///
    /// Gives back the buffer to re-post, the old one when registration fails.
    fn grow(
        &self,
        conn: Option<ConnectionId>,
        shared: bool,
        observed: usize,
        buffer: RegisteredBuffer,
    ) -> RegisteredBuffer {
        warn!(
            "{} byte message did not fit a {} byte receive buffer of {:?}, dropped",
            observed,
            buffer.length(),
            conn
        );
        if !shared && !self.accepting(conn) {
            return buffer;
        }
        let len = self.config.oversize_len(observed);
        match RegisteredBuffer::register(self.provider, len, receive_access()) {
            Ok(larger) => {
                debug!(
                    "receive buffer of {:?} grown from {} to {} bytes",
                    conn,
                    buffer.length(),
                    len
                );
                // dropping the small buffer deregisters it
                larger
            }
            Err(err) => {
                warn!("failed to register a {} byte receive buffer: {}, keeping the old one", len, err);
                buffer
            }
        }
    }

    /// Flushed work of a connection that is going down
    fn flushed(&mut self, conn: Option<ConnectionId>, what: &str) {
        let state = conn
            .and_then(|id| self.connections.get(id.0))
            .map(|conn| conn.core.state);
        match state {
            Some(ConnectionState::Disconnecting | ConnectionState::Closed) | None => {
                trace!("flushed {} of {:?} discarded", what, conn);
            }
            Some(other) => {
                warn!("{} of {:?} flushed in state {:?}", what, conn, other);
                self.fail(conn);
            }
        }
    }

    /// Disconnect after a failed completion
    fn fail(&mut self, conn: Option<ConnectionId>) {
        if let Some((id, connection)) = conn.and_then(|id| self.connections.get_mut(id.0).map(|c| (id, c))) {
            shut(id, &mut connection.core, self.provider.as_ref());
        }
    }

    /// Re-post a receive buffer, or park it while its connection goes down.
    ///
    /// A failed re-post disconnects, except for a buffer that was just grown: that one stays
    /// parked in its slot.
    fn give_back(
        &mut self,
        conn: Option<ConnectionId>,
        index: usize,
        shared: bool,
        buffer: RegisteredBuffer,
        grown: bool,
    ) {
        let post = shared || self.accepting(conn);
        let provider = self.provider;
        let contexts = &mut *self.contexts;
        let pool = if shared {
            self.shared_pool.as_mut()
        } else {
            conn.and_then(|id| self.connections.get_mut(id.0))
                .and_then(|conn| conn.core.pool.as_mut())
        };
        // without a pool the connection is gone, dropping the buffer releases it
        let pool = match pool {
            Some(pool) => pool,
            None => return,
        };
        if !post {
            pool.restore(index, buffer);
            return;
        }
        if let Err(err) = pool.repost(index, buffer, provider.as_ref(), contexts) {
            if grown {
                error!("failed to post grown receive slot {} of {:?}: {}", index, conn, err);
                return;
            }
            error!("failed to re-post receive slot {} of {:?}: {}", index, conn, err);
            self.fail(conn);
        }
    }

    /// A send-queue request completed
    fn on_send_queue(&mut self, wc: WorkCompletion, conn: Option<ConnectionId>, slot: BufferSlot) {
        let (id, connection) = match conn.and_then(|id| self.connections.get_mut(id.0).map(|c| (id, c))) {
            Some(found) => found,
            None => {
                debug!("send-queue completion for a released connection: {:?}", wc);
                return;
            }
        };
        let Connection {
            ref mut core,
            ref mut handler,
        } = *connection;
        let one_off = core.complete_send(slot);
        match wc.result() {
            Ok(len) => {
                let completion = match (wc.opcode(), one_off.as_ref()) {
                    (Some(WcOpcode::Send), _) => Some(Completion::Send { len }),
                    (Some(WcOpcode::RdmaRead), Some(read)) => match read.kind {
                        OneOffKind::ReadTarget(remote) => Some(Completion::RemoteRead {
                            data: read.buffer.as_slice(),
                            remote,
                        }),
                        _ => None,
                    },
                    (Some(WcOpcode::RdmaWrite), Some(write)) => match write.kind {
                        OneOffKind::WriteSource(remote) => Some(Completion::RemoteWrite { len, remote }),
                        _ => None,
                    },
                    _ => None,
                };
                match completion {
                    Some(completion) => {
                        let mut ctx = ConnectionCtx::new(
                            id,
                            core,
                            Env {
                                provider: self.provider,
                                contexts: &mut *self.contexts,
                                config: self.config,
                            },
                        );
                        let result = handler.on_completion(&mut ctx, completion);
                        settle(id, core, result, self.provider.as_ref());
                    }
                    None => warn!("{} unexpected send-queue completion {:?}", id, wc),
                }
                let mut env = Env {
                    provider: self.provider,
                    contexts: &mut *self.contexts,
                    config: self.config,
                };
                if let Err(err) = core.flush(id, &mut env) {
                    error!("{} failed to post queued sends: {}", id, err);
                    shut(id, core, self.provider.as_ref());
                }
            }
            Err(WCError::WrFlushErr)
                if matches!(
                    core.state,
                    ConnectionState::Disconnecting | ConnectionState::Closed
                ) =>
            {
                trace!("flushed send of {} discarded", id);
            }
            Err(err) => {
                error!("{} send-queue request failed: {}", id, err);
                shut(id, core, self.provider.as_ref());
            }
        }
    }
}

/// Run `worker` on a dedicated thread with its own current-thread runtime.
///
/// ```
/// use rdma_kv_engine::{spawn_worker, EngineConfig, LoopbackProvider, TransportProvider, WorkerContext};
/// use std::sync::Arc;
///
/// let provider: Arc<dyn TransportProvider> = Arc::new(LoopbackProvider::new());
/// let handle = spawn_worker("worker-0", move || async move {
///     let mut worker = WorkerContext::new(provider, EngineConfig::default())?;
///     worker.run_until(async {}).await
/// })
/// .unwrap();
/// handle.join().unwrap().unwrap();
/// ```
pub fn spawn_worker<F, Fut>(name: impl Into<String>, worker: F) -> std::io::Result<JoinHandle<Result<()>>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>>,
{
    thread::Builder::new().name(name.into()).spawn(move || -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(worker())
    })
}
