use super::{
    event_fd::EventFd, CmChannelId, CmEvent, CmEventKind, CqId, EndpointId, QpInitAttr, SrqId,
    TransportProvider,
};
use crate::{
    access::AccessFlag,
    completion_queue::{WCError, WcOpcode, WorkCompletion},
    id,
    memory_region::{MrKeys, RemoteDescriptor},
    work_request::{RecvWr, SendOpcode, SendWr, Sge},
};
use clippy_utilities::Cast;
use enumflags2::BitFlags;
use parking_lot::Mutex;
use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    io,
    net::SocketAddr,
    os::unix::prelude::{AsRawFd, RawFd},
    ptr,
    time::Duration,
};
use tracing::{debug, error, trace, warn};

/// Insert `value` under the first key from `next_key` that is not taken yet
fn insert_fresh<V>(map: &mut HashMap<u32, V>, value: V, mut next_key: impl FnMut() -> u32) -> u32 {
    loop {
        if let Entry::Vacant(vacant) = map.entry(next_key()) {
            let key = *vacant.key();
            let _value = vacant.insert(value);
            return key;
        }
    }
}

/// A registered range
#[derive(Debug, Clone, Copy)]
struct Region {
    /// Start address
    addr: usize,
    /// Length
    len: usize,
    /// Access flags
    access: BitFlags<AccessFlag>,
    /// Remote key
    rkey: u32,
}

impl Region {
    /// Whether `[addr, addr + len)` lies inside the region
    fn covers(&self, addr: u64, len: u64) -> bool {
        let start: u64 = self.addr.cast();
        let region_len: u64 = self.len.cast();
        addr >= start
            && addr
                .checked_add(len)
                .map_or(false, |end| end <= start.saturating_add(region_len))
    }
}

/// Connection-manager state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    /// Freshly created
    Idle,
    /// Listening for connect requests
    Listening,
    /// Address resolved
    AddrResolved(SocketAddr),
    /// Route resolved, ready to connect
    RouteResolved(SocketAddr),
    /// Client side, waiting for the server to accept
    Connecting(EndpointId),
    /// Server side, waiting for the application to accept
    ConnectRequested(EndpointId),
    /// Connected to a peer
    Connected(EndpointId),
    /// Disconnected, posts are flushed
    Disconnected,
}

/// An endpoint with its queue pair
#[derive(Debug)]
struct Endpoint {
    /// Channel events are delivered on
    channel: CmChannelId,
    /// Connection-manager state
    state: EndpointState,
    /// Address this endpoint listens on
    listen_addr: Option<SocketAddr>,
    /// Queue pair attributes, once created
    qp: Option<QpInitAttr>,
    /// Posted receives, when no shared receive queue is used
    recv_queue: VecDeque<RecvWr>,
}

/// Completion queue and its completion channel
#[derive(Debug)]
struct Cq {
    /// Maximum number of queued completions
    capacity: usize,
    /// Queued completions
    entries: VecDeque<WorkCompletion>,
    /// Whether the next completion generates a channel event
    armed: bool,
    /// Channel events not yet consumed
    pending_events: u32,
    /// Consumed but unacknowledged channel events
    unacked_events: u32,
    /// Readiness of the completion channel
    event_fd: EventFd,
}

/// Shared receive queue
#[derive(Debug)]
struct Srq {
    /// Maximum number of posted receives
    max_wr: usize,
    /// Posted receives
    queue: VecDeque<RecvWr>,
}

/// Connection-manager channel
#[derive(Debug)]
struct CmChannel {
    /// Undelivered events
    events: VecDeque<CmEvent>,
    /// Readiness of the channel
    event_fd: EventFd,
}

/// Everything the device knows, behind one lock
#[derive(Debug)]
struct State {
    /// Next endpoint number
    next_endpoint: u32,
    /// Next completion queue number
    next_cq: u32,
    /// Next shared receive queue number
    next_srq: u32,
    /// Next channel number
    next_channel: u32,
    /// Registrations by local key
    regions: HashMap<u32, Region>,
    /// Local key by remote key
    rkeys: HashMap<u32, u32>,
    /// Endpoints by number
    endpoints: HashMap<EndpointId, Endpoint>,
    /// Listening endpoints by address
    listeners: HashMap<SocketAddr, EndpointId>,
    /// Completion queues
    cqs: HashMap<CqId, Cq>,
    /// Shared receive queues
    srqs: HashMap<SrqId, Srq>,
    /// Connection-manager channels
    channels: HashMap<CmChannelId, CmChannel>,
}

/// In-process transport provider with reliable-connected semantics.
///
/// Sends are delivered into the peer's posted receives in FIFO order, one-sided reads and
/// writes are checked against the remote key, bounds and access of the target registration,
/// and a disconnect flushes every posted receive of both sides. Completion and
/// connection-manager channels signal readiness through an `eventfd`, so workers on
/// different threads can share one provider.
#[derive(Debug)]
pub struct LoopbackProvider {
    /// Device state
    state: Mutex<State>,
}

impl Default for LoopbackProvider {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Error for an unknown object
fn not_found(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("unknown {what}"))
}

/// Error for a call in the wrong endpoint state
fn bad_state(id: EndpointId, state: EndpointState, op: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{op} on {id} in state {state:?}"),
    )
}

/// Queue a completion and fire the channel if armed
fn push_completion(cqs: &mut HashMap<CqId, Cq>, cq_id: CqId, wc: WorkCompletion) {
    let cq = match cqs.get_mut(&cq_id) {
        Some(cq) => cq,
        None => {
            warn!("completion for destroyed {:?} dropped: {:?}", cq_id, wc);
            return;
        }
    };
    if cq.entries.len() >= cq.capacity {
        error!("{:?} overrun, completion dropped: {:?}", cq_id, wc);
        return;
    }
    cq.entries.push_back(wc);
    if cq.armed {
        cq.armed = false;
        cq.pending_events = cq.pending_events.saturating_add(1);
        if let Err(err) = cq.event_fd.notify() {
            warn!("failed to signal {:?}: {:?}", cq_id, err);
        }
    }
}

/// Queue a connection-manager event
fn push_cm_event(channels: &mut HashMap<CmChannelId, CmChannel>, channel: CmChannelId, event: CmEvent) {
    match channels.get_mut(&channel) {
        Some(ch) => {
            trace!("cm event {:?} on {:?}", event, channel);
            ch.events.push_back(event);
            if let Err(err) = ch.event_fd.notify() {
                warn!("failed to signal {:?}: {:?}", channel, err);
            }
        }
        None => warn!("cm event for destroyed {:?} dropped: {:?}", channel, event),
    }
}

/// Check a local scatter/gather entry
fn check_local(regions: &HashMap<u32, Region>, sge: &Sge, need: BitFlags<AccessFlag>) -> Result<(), WCError> {
    let region = regions.get(&sge.lkey).ok_or(WCError::LocProtErr)?;
    if !region.covers(sge.addr, sge.length.into()) || !region.access.contains(need) {
        return Err(WCError::LocProtErr);
    }
    Ok(())
}

/// Check a remote range, returning the target address
fn check_remote(
    regions: &HashMap<u32, Region>,
    rkeys: &HashMap<u32, u32>,
    remote: &RemoteDescriptor,
    len: u32,
    need: AccessFlag,
) -> Result<u64, WCError> {
    let region = rkeys
        .get(&remote.rkey)
        .and_then(|lkey| regions.get(lkey))
        .ok_or(WCError::RemAccessErr)?;
    if !region.covers(remote.addr, len.into()) || !region.access.contains(need) {
        return Err(WCError::RemAccessErr);
    }
    Ok(remote.addr)
}

/// Copy `len` bytes between two ranges validated against live registrations
#[allow(clippy::as_conversions)]
fn copy_registered(src: u64, dst: u64, len: u32) {
    let src: usize = src.cast();
    let dst: usize = dst.cast();
    let len: usize = len.cast();
    // SAFETY: both ranges lie inside registrations checked under the device lock;
    // registrations are only removed under the same lock, before their memory is freed
    unsafe { ptr::copy(src as *const u8, dst as *mut u8, len) }
}

/// Flush every posted receive of an endpoint
fn flush_receives(endpoint: &mut Endpoint, id: EndpointId, cqs: &mut HashMap<CqId, Cq>) {
    let cq = match endpoint.qp {
        Some(attr) => attr.cq,
        None => return,
    };
    for wr in endpoint.recv_queue.drain(..) {
        push_completion(
            cqs,
            cq,
            WorkCompletion::failed(wr.wr_id.into(), WcOpcode::Recv, WCError::WrFlushErr, 0, id.0),
        );
    }
}

impl State {
    /// Fresh device state
    fn new() -> Self {
        Self {
            next_endpoint: id::random_endpoint_base(),
            next_cq: 1,
            next_srq: 1,
            next_channel: 1,
            regions: HashMap::new(),
            rkeys: HashMap::new(),
            endpoints: HashMap::new(),
            listeners: HashMap::new(),
            cqs: HashMap::new(),
            srqs: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    /// Allocate an endpoint number
    fn alloc_endpoint(&mut self, channel: CmChannelId, state: EndpointState) -> EndpointId {
        let id = EndpointId(self.next_endpoint);
        self.next_endpoint = self.next_endpoint.wrapping_add(1);
        let _old = self.endpoints.insert(
            id,
            Endpoint {
                channel,
                state,
                listen_addr: None,
                qp: None,
                recv_queue: VecDeque::new(),
            },
        );
        id
    }

    /// Take both sides of a connection down
    fn disconnect_pair(&mut self, id: EndpointId, peer: EndpointId) {
        for side in [id, peer] {
            if let Some(endpoint) = self.endpoints.get_mut(&side) {
                endpoint.state = EndpointState::Disconnected;
                flush_receives(endpoint, side, &mut self.cqs);
                let channel = endpoint.channel;
                push_cm_event(
                    &mut self.channels,
                    channel,
                    CmEvent {
                        kind: CmEventKind::Disconnected,
                        endpoint: side,
                        listener: None,
                    },
                );
            }
        }
    }

    /// Deliver a send into the peer's next posted receive.
    ///
    /// Returns the sender's completion status.
    fn deliver(&mut self, peer_id: EndpointId, sge: &Sge) -> Result<(), WCError> {
        let Self {
            endpoints,
            srqs,
            regions,
            cqs,
            ..
        } = self;
        let peer = endpoints.get_mut(&peer_id).ok_or(WCError::RetryExc)?;
        let attr = peer.qp.ok_or(WCError::RetryExc)?;
        let recv = match attr.srq {
            Some(srq) => srqs.get_mut(&srq).and_then(|q| q.queue.pop_front()),
            None => peer.recv_queue.pop_front(),
        };
        let recv = match recv {
            Some(recv) => recv,
            None => {
                debug!("no receive posted on {}", peer_id);
                return Err(WCError::RnrRetryExc);
            }
        };
        if check_local(regions, &recv.sge, AccessFlag::LocalWrite.into()).is_err() {
            push_completion(
                cqs,
                attr.cq,
                WorkCompletion::failed(recv.wr_id.into(), WcOpcode::Recv, WCError::LocProtErr, 0, peer_id.0),
            );
            return Ok(());
        }
        if sge.length > recv.sge.length {
            // the receiver sees the truncation, the message is lost
            push_completion(
                cqs,
                attr.cq,
                WorkCompletion::failed(
                    recv.wr_id.into(),
                    WcOpcode::Recv,
                    WCError::LocLenErr,
                    sge.length,
                    peer_id.0,
                ),
            );
            return Ok(());
        }
        copy_registered(sge.addr, recv.sge.addr, sge.length);
        push_completion(
            cqs,
            attr.cq,
            WorkCompletion::success(recv.wr_id.into(), WcOpcode::Recv, sge.length, peer_id.0),
        );
        Ok(())
    }
}

impl LoopbackProvider {
    /// Create a new device
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::new()),
        }
    }

    /// Number of live registrations
    #[inline]
    #[must_use]
    pub fn registered_regions(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Number of receives posted on an endpoint's own receive queue
    #[inline]
    #[must_use]
    pub fn posted_receives(&self, id: EndpointId) -> usize {
        self.state
            .lock()
            .endpoints
            .get(&id)
            .map_or(0, |ep| ep.recv_queue.len())
    }

    /// Number of receives posted on a shared receive queue
    #[inline]
    #[must_use]
    pub fn srq_posted(&self, srq: SrqId) -> usize {
        self.state
            .lock()
            .srqs
            .get(&srq)
            .map_or(0, |q| q.queue.len())
    }

    /// Number of consumed but unacknowledged completion-channel events
    #[inline]
    #[must_use]
    pub fn unacked_cq_events(&self, cq: CqId) -> u32 {
        self.state.lock().cqs.get(&cq).map_or(0, |cq| cq.unacked_events)
    }

    /// Number of live endpoints
    #[inline]
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }
}

impl TransportProvider for LoopbackProvider {
    fn create_cm_channel(&self) -> io::Result<CmChannelId> {
        let mut state = self.state.lock();
        let id = CmChannelId(state.next_channel);
        state.next_channel = state.next_channel.wrapping_add(1);
        let _old = state.channels.insert(
            id,
            CmChannel {
                events: VecDeque::new(),
                event_fd: EventFd::new()?,
            },
        );
        Ok(id)
    }

    fn cm_channel_fd(&self, channel: CmChannelId) -> Option<RawFd> {
        self.state
            .lock()
            .channels
            .get(&channel)
            .map(|ch| ch.event_fd.as_raw_fd())
    }

    fn get_cm_event(&self, channel: CmChannelId) -> io::Result<Option<CmEvent>> {
        let mut state = self.state.lock();
        let ch = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| not_found("cm channel"))?;
        let event = ch.events.pop_front();
        if ch.events.is_empty() {
            ch.event_fd.drain()?;
        }
        Ok(event)
    }

    fn create_id(&self, channel: CmChannelId) -> io::Result<EndpointId> {
        let mut state = self.state.lock();
        if !state.channels.contains_key(&channel) {
            return Err(not_found("cm channel"));
        }
        Ok(state.alloc_endpoint(channel, EndpointState::Idle))
    }

    fn listen(&self, id: EndpointId, addr: SocketAddr, backlog: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.listeners.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} is already listened on"),
            ));
        }
        let endpoint = state.endpoints.get_mut(&id).ok_or_else(|| not_found("endpoint"))?;
        if endpoint.state != EndpointState::Idle {
            return Err(bad_state(id, endpoint.state, "listen"));
        }
        endpoint.state = EndpointState::Listening;
        endpoint.listen_addr = Some(addr);
        let _old = state.listeners.insert(addr, id);
        debug!("{} listening on {} backlog {}", id, addr, backlog);
        Ok(())
    }

    fn resolve_addr(&self, id: EndpointId, addr: SocketAddr, timeout: Duration) -> io::Result<()> {
        if timeout.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "address resolution timed out"));
        }
        let mut state = self.state.lock();
        let reachable = state.listeners.contains_key(&addr);
        let endpoint = state.endpoints.get_mut(&id).ok_or_else(|| not_found("endpoint"))?;
        if endpoint.state != EndpointState::Idle {
            return Err(bad_state(id, endpoint.state, "resolve_addr"));
        }
        if !reachable {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no route to {addr}"),
            ));
        }
        endpoint.state = EndpointState::AddrResolved(addr);
        Ok(())
    }

    fn resolve_route(&self, id: EndpointId, timeout: Duration) -> io::Result<()> {
        if timeout.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "route resolution timed out"));
        }
        let mut state = self.state.lock();
        let endpoint = state.endpoints.get_mut(&id).ok_or_else(|| not_found("endpoint"))?;
        match endpoint.state {
            EndpointState::AddrResolved(addr) => {
                endpoint.state = EndpointState::RouteResolved(addr);
                Ok(())
            }
            other => Err(bad_state(id, other, "resolve_route")),
        }
    }

    fn create_qp(&self, id: EndpointId, attr: &QpInitAttr) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.cqs.contains_key(&attr.cq) {
            return Err(not_found("completion queue"));
        }
        if let Some(srq) = attr.srq {
            if !state.srqs.contains_key(&srq) {
                return Err(not_found("shared receive queue"));
            }
        }
        let endpoint = state.endpoints.get_mut(&id).ok_or_else(|| not_found("endpoint"))?;
        if endpoint.qp.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{id} already has a queue pair"),
            ));
        }
        endpoint.qp = Some(*attr);
        Ok(())
    }

    fn connect(&self, id: EndpointId) -> io::Result<()> {
        let mut state = self.state.lock();
        let (channel, addr) = {
            let endpoint = state.endpoints.get(&id).ok_or_else(|| not_found("endpoint"))?;
            match (endpoint.state, endpoint.qp) {
                (EndpointState::RouteResolved(addr), Some(_)) => (endpoint.channel, addr),
                (other, _) => return Err(bad_state(id, other, "connect")),
            }
        };
        let listener = state.listeners.get(&addr).copied();
        let listener_channel = listener.and_then(|l| state.endpoints.get(&l)).map(|l| l.channel);
        match (listener, listener_channel) {
            (Some(listener), Some(listener_channel)) => {
                let server = state.alloc_endpoint(listener_channel, EndpointState::ConnectRequested(id));
                if let Some(endpoint) = state.endpoints.get_mut(&id) {
                    endpoint.state = EndpointState::Connecting(server);
                }
                push_cm_event(
                    &mut state.channels,
                    listener_channel,
                    CmEvent {
                        kind: CmEventKind::ConnectRequest,
                        endpoint: server,
                        listener: Some(listener),
                    },
                );
            }
            _ => push_cm_event(
                &mut state.channels,
                channel,
                CmEvent {
                    kind: CmEventKind::Unreachable,
                    endpoint: id,
                    listener: None,
                },
            ),
        }
        Ok(())
    }

    fn accept(&self, id: EndpointId) -> io::Result<()> {
        let mut state = self.state.lock();
        let (client, server_channel) = {
            let endpoint = state.endpoints.get(&id).ok_or_else(|| not_found("endpoint"))?;
            match (endpoint.state, endpoint.qp) {
                (EndpointState::ConnectRequested(client), Some(_)) => (client, endpoint.channel),
                (other, _) => return Err(bad_state(id, other, "accept")),
            }
        };
        let client_channel = match state.endpoints.get_mut(&client) {
            Some(endpoint) if endpoint.state == EndpointState::Connecting(id) => {
                endpoint.state = EndpointState::Connected(id);
                endpoint.channel
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("the peer of {id} went away"),
                ))
            }
        };
        if let Some(endpoint) = state.endpoints.get_mut(&id) {
            endpoint.state = EndpointState::Connected(client);
        }
        for (channel, endpoint) in [(server_channel, id), (client_channel, client)] {
            push_cm_event(
                &mut state.channels,
                channel,
                CmEvent {
                    kind: CmEventKind::Established,
                    endpoint,
                    listener: None,
                },
            );
        }
        Ok(())
    }

    fn reject(&self, id: EndpointId) -> io::Result<()> {
        let mut state = self.state.lock();
        let client = match state.endpoints.get(&id).map(|ep| ep.state) {
            Some(EndpointState::ConnectRequested(client)) => client,
            Some(other) => return Err(bad_state(id, other, "reject")),
            None => return Err(not_found("endpoint")),
        };
        let _server = state.endpoints.remove(&id);
        if let Some(endpoint) = state.endpoints.get_mut(&client) {
            endpoint.state = EndpointState::Idle;
            let channel = endpoint.channel;
            push_cm_event(
                &mut state.channels,
                channel,
                CmEvent {
                    kind: CmEventKind::Rejected,
                    endpoint: client,
                    listener: None,
                },
            );
        }
        Ok(())
    }

    fn disconnect(&self, id: EndpointId) -> io::Result<()> {
        let mut state = self.state.lock();
        let endpoint_state = state
            .endpoints
            .get(&id)
            .map(|ep| ep.state)
            .ok_or_else(|| not_found("endpoint"))?;
        match endpoint_state {
            EndpointState::Connected(peer) => {
                state.disconnect_pair(id, peer);
                Ok(())
            }
            EndpointState::Disconnected => Ok(()),
            other => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("disconnect on {id} in state {other:?}"),
            )),
        }
    }

    fn destroy_id(&self, id: EndpointId) -> io::Result<()> {
        let mut state = self.state.lock();
        let endpoint_state = state
            .endpoints
            .get(&id)
            .map(|ep| ep.state)
            .ok_or_else(|| not_found("endpoint"))?;
        match endpoint_state {
            EndpointState::Connected(peer) => state.disconnect_pair(id, peer),
            EndpointState::ConnectRequested(client) => {
                if let Some(endpoint) = state.endpoints.get_mut(&client) {
                    endpoint.state = EndpointState::Idle;
                    let channel = endpoint.channel;
                    push_cm_event(
                        &mut state.channels,
                        channel,
                        CmEvent {
                            kind: CmEventKind::Rejected,
                            endpoint: client,
                            listener: None,
                        },
                    );
                }
            }
            _ => {}
        }
        if let Some(endpoint) = state.endpoints.remove(&id) {
            if let Some(addr) = endpoint.listen_addr {
                let _listener = state.listeners.remove(&addr);
            }
            if !endpoint.recv_queue.is_empty() {
                debug!("{} destroyed with {} receives posted", id, endpoint.recv_queue.len());
            }
        }
        Ok(())
    }

    fn create_cq(&self, size: u32) -> io::Result<CqId> {
        let mut state = self.state.lock();
        let id = CqId(state.next_cq);
        state.next_cq = state.next_cq.wrapping_add(1);
        let _old = state.cqs.insert(
            id,
            Cq {
                capacity: size.cast(),
                entries: VecDeque::new(),
                armed: false,
                pending_events: 0,
                unacked_events: 0,
                event_fd: EventFd::new()?,
            },
        );
        Ok(id)
    }

    fn destroy_cq(&self, cq: CqId) -> io::Result<()> {
        let mut state = self.state.lock();
        let removed = state.cqs.remove(&cq).ok_or_else(|| not_found("completion queue"))?;
        if removed.unacked_events != 0 {
            warn!("{:?} destroyed with {} unacknowledged events", cq, removed.unacked_events);
        }
        Ok(())
    }

    fn create_srq(&self, max_wr: u32) -> io::Result<SrqId> {
        let mut state = self.state.lock();
        let id = SrqId(state.next_srq);
        state.next_srq = state.next_srq.wrapping_add(1);
        let _old = state.srqs.insert(
            id,
            Srq {
                max_wr: max_wr.cast(),
                queue: VecDeque::new(),
            },
        );
        Ok(id)
    }

    fn destroy_srq(&self, srq: SrqId) -> io::Result<()> {
        let _removed = self
            .state
            .lock()
            .srqs
            .remove(&srq)
            .ok_or_else(|| not_found("shared receive queue"))?;
        Ok(())
    }

    fn register(&self, addr: usize, len: usize, access: BitFlags<AccessFlag>) -> io::Result<MrKeys> {
        if addr == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "null address"));
        }
        let mut state = self.state.lock();
        // reserve the remote key first, the region records it
        let rkey = insert_fresh(&mut state.rkeys, 0, id::random_key);
        let lkey = insert_fresh(
            &mut state.regions,
            Region {
                addr,
                len,
                access,
                rkey,
            },
            id::random_key,
        );
        let _placeholder = state.rkeys.insert(rkey, lkey);
        trace!("registered {:#x}+{} lkey {:#x} rkey {:#x}", addr, len, lkey, rkey);
        Ok(MrKeys { lkey, rkey })
    }

    fn deregister(&self, keys: MrKeys) -> io::Result<()> {
        let mut state = self.state.lock();
        let region = state
            .regions
            .remove(&keys.lkey)
            .ok_or_else(|| not_found("registration"))?;
        let _lkey = state.rkeys.remove(&region.rkey);
        // receives still posted on the region must never be written to again
        let mut purged = 0_usize;
        for endpoint in state.endpoints.values_mut() {
            let before = endpoint.recv_queue.len();
            endpoint.recv_queue.retain(|wr| wr.sge.lkey != keys.lkey);
            purged = purged.saturating_add(before.saturating_sub(endpoint.recv_queue.len()));
        }
        for srq in state.srqs.values_mut() {
            let before = srq.queue.len();
            srq.queue.retain(|wr| wr.sge.lkey != keys.lkey);
            purged = purged.saturating_add(before.saturating_sub(srq.queue.len()));
        }
        if purged != 0 {
            debug!("deregistration of lkey {:#x} purged {} posted receives", keys.lkey, purged);
        }
        Ok(())
    }

    fn post_recv(&self, id: EndpointId, wr: RecvWr) -> io::Result<()> {
        let mut guard = self.state.lock();
        let State { endpoints, cqs, .. } = &mut *guard;
        let endpoint = endpoints.get_mut(&id).ok_or_else(|| not_found("endpoint"))?;
        let attr = endpoint
            .qp
            .ok_or_else(|| bad_state(id, endpoint.state, "post_recv without queue pair"))?;
        if attr.srq.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{id} receives through a shared receive queue"),
            ));
        }
        if endpoint.state == EndpointState::Disconnected {
            push_completion(
                cqs,
                attr.cq,
                WorkCompletion::failed(wr.wr_id.into(), WcOpcode::Recv, WCError::WrFlushErr, 0, id.0),
            );
            return Ok(());
        }
        if endpoint.recv_queue.len() >= attr.max_recv_wr.cast() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("receive queue of {id} is full"),
            ));
        }
        endpoint.recv_queue.push_back(wr);
        Ok(())
    }

    fn post_srq_recv(&self, srq: SrqId, wr: RecvWr) -> io::Result<()> {
        let mut state = self.state.lock();
        let queue = state
            .srqs
            .get_mut(&srq)
            .ok_or_else(|| not_found("shared receive queue"))?;
        if queue.queue.len() >= queue.max_wr {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{srq:?} is full"),
            ));
        }
        queue.queue.push_back(wr);
        Ok(())
    }

    fn post_send(&self, id: EndpointId, wr: SendWr) -> io::Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (endpoint_state, attr) = {
            let endpoint = state.endpoints.get(&id).ok_or_else(|| not_found("endpoint"))?;
            let attr = endpoint
                .qp
                .ok_or_else(|| bad_state(id, endpoint.state, "post_send without queue pair"))?;
            (endpoint.state, attr)
        };
        let opcode = match wr.opcode {
            SendOpcode::Send => WcOpcode::Send,
            SendOpcode::RdmaRead => WcOpcode::RdmaRead,
            SendOpcode::RdmaWrite => WcOpcode::RdmaWrite,
        };
        let peer = match endpoint_state {
            EndpointState::Connected(peer) => peer,
            EndpointState::Disconnected => {
                push_completion(
                    &mut state.cqs,
                    attr.cq,
                    WorkCompletion::failed(wr.wr_id.into(), opcode, WCError::WrFlushErr, 0, id.0),
                );
                return Ok(());
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("post_send on {id} in state {other:?}"),
                ))
            }
        };

        let local_need = match wr.opcode {
            SendOpcode::RdmaRead => AccessFlag::LocalWrite.into(),
            SendOpcode::Send | SendOpcode::RdmaWrite => BitFlags::empty(),
        };
        let outcome = check_local(&state.regions, &wr.sge, local_need).and_then(|()| match wr.opcode {
            SendOpcode::Send => state.deliver(peer, &wr.sge),
            SendOpcode::RdmaRead => {
                let remote = wr.remote.ok_or(WCError::LocQpOpErr)?;
                let src = check_remote(
                    &state.regions,
                    &state.rkeys,
                    &remote,
                    wr.sge.length,
                    AccessFlag::RemoteRead,
                )?;
                copy_registered(src, wr.sge.addr, wr.sge.length);
                Ok(())
            }
            SendOpcode::RdmaWrite => {
                let remote = wr.remote.ok_or(WCError::LocQpOpErr)?;
                let dst = check_remote(
                    &state.regions,
                    &state.rkeys,
                    &remote,
                    wr.sge.length,
                    AccessFlag::RemoteWrite,
                )?;
                copy_registered(wr.sge.addr, dst, wr.sge.length);
                Ok(())
            }
        });
        match outcome {
            Ok(()) => {
                if wr.signaled {
                    push_completion(
                        &mut state.cqs,
                        attr.cq,
                        WorkCompletion::success(wr.wr_id.into(), opcode, wr.sge.length, id.0),
                    );
                }
            }
            Err(err) => {
                debug!("{:?} on {} failed: {}", wr.opcode, id, err);
                push_completion(
                    &mut state.cqs,
                    attr.cq,
                    WorkCompletion::failed(wr.wr_id.into(), opcode, err, wr.sge.length, id.0),
                );
            }
        }
        Ok(())
    }

    fn poll_cq(&self, cq: CqId, max: usize, out: &mut Vec<WorkCompletion>) -> io::Result<usize> {
        let mut state = self.state.lock();
        let cq = state.cqs.get_mut(&cq).ok_or_else(|| not_found("completion queue"))?;
        let n = max.min(cq.entries.len());
        out.extend(cq.entries.drain(..n));
        Ok(n)
    }

    fn req_notify_cq(&self, cq: CqId, _solicited_only: bool) -> io::Result<()> {
        let mut state = self.state.lock();
        let cq = state.cqs.get_mut(&cq).ok_or_else(|| not_found("completion queue"))?;
        cq.armed = true;
        Ok(())
    }

    fn get_cq_event(&self, cq: CqId) -> io::Result<bool> {
        let mut state = self.state.lock();
        let cq = state.cqs.get_mut(&cq).ok_or_else(|| not_found("completion queue"))?;
        if cq.pending_events == 0 {
            cq.event_fd.drain()?;
            return Ok(false);
        }
        cq.pending_events = cq.pending_events.saturating_sub(1);
        cq.unacked_events = cq.unacked_events.saturating_add(1);
        if cq.pending_events == 0 {
            cq.event_fd.drain()?;
        }
        Ok(true)
    }

    fn ack_cq_events(&self, cq: CqId, count: u32) {
        if let Some(cq) = self.state.lock().cqs.get_mut(&cq) {
            cq.unacked_events = cq.unacked_events.saturating_sub(count);
        }
    }

    fn cq_channel_fd(&self, cq: CqId) -> Option<RawFd> {
        self.state
            .lock()
            .cqs
            .get(&cq)
            .map(|cq| cq.event_fd.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_context::WorkRequestId;
    use std::alloc::Layout;

    /// A connected pair of endpoints with one completion queue each
    struct Pair {
        dev: LoopbackProvider,
        client: EndpointId,
        server: EndpointId,
        client_cq: CqId,
        server_cq: CqId,
    }

    fn attr(cq: CqId) -> QpInitAttr {
        QpInitAttr {
            cq,
            srq: None,
            max_send_wr: 8,
            max_recv_wr: 16,
        }
    }

    fn connected_pair() -> Pair {
        let dev = LoopbackProvider::new();
        let addr: SocketAddr = "10.0.0.1:11211".parse().unwrap();
        let server_ch = dev.create_cm_channel().unwrap();
        let client_ch = dev.create_cm_channel().unwrap();
        let listener = dev.create_id(server_ch).unwrap();
        dev.listen(listener, addr, 16).unwrap();

        let client_cq = dev.create_cq(64).unwrap();
        let server_cq = dev.create_cq(64).unwrap();
        let client = dev.create_id(client_ch).unwrap();
        dev.resolve_addr(client, addr, Duration::from_millis(100)).unwrap();
        dev.resolve_route(client, Duration::from_millis(100)).unwrap();
        dev.create_qp(client, &attr(client_cq)).unwrap();
        dev.connect(client).unwrap();

        let request = dev.get_cm_event(server_ch).unwrap().unwrap();
        assert_eq!(request.kind, CmEventKind::ConnectRequest);
        assert_eq!(request.listener, Some(listener));
        let server = request.endpoint;
        dev.create_qp(server, &attr(server_cq)).unwrap();
        dev.accept(server).unwrap();
        assert_eq!(dev.get_cm_event(server_ch).unwrap().unwrap().kind, CmEventKind::Established);
        assert_eq!(dev.get_cm_event(client_ch).unwrap().unwrap().kind, CmEventKind::Established);
        Pair {
            dev,
            client,
            server,
            client_cq,
            server_cq,
        }
    }

    /// Heap memory registered with the device
    struct Mem {
        ptr: *mut u8,
        layout: Layout,
        keys: MrKeys,
    }

    impl Mem {
        fn new(dev: &LoopbackProvider, len: usize, access: BitFlags<AccessFlag>) -> Self {
            let layout = Layout::from_size_align(len, 8).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            let keys = dev.register(ptr as usize, len, access).unwrap();
            Self { ptr, layout, keys }
        }

        fn sge(&self, len: u32) -> Sge {
            Sge {
                addr: self.ptr as u64,
                length: len,
                lkey: self.keys.lkey,
            }
        }

        fn bytes(&self, len: usize) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self.ptr, len) }
        }

        fn fill(&mut self, data: &[u8]) {
            unsafe { std::slice::from_raw_parts_mut(self.ptr, data.len()) }.copy_from_slice(data);
        }

        fn release(self, dev: &LoopbackProvider) {
            dev.deregister(self.keys).unwrap();
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }

    fn poll_all(dev: &LoopbackProvider, cq: CqId) -> Vec<WorkCompletion> {
        let mut out = Vec::new();
        let _n = dev.poll_cq(cq, 64, &mut out).unwrap();
        out
    }

    #[test]
    fn send_lands_in_posted_receives_in_order() {
        let p = connected_pair();
        let recv_a = Mem::new(&p.dev, 64, AccessFlag::LocalWrite.into());
        let recv_b = Mem::new(&p.dev, 64, AccessFlag::LocalWrite.into());
        p.dev.post_recv(p.server, RecvWr::new_recv(recv_a.sge(64), WorkRequestId::from_raw(1))).unwrap();
        p.dev.post_recv(p.server, RecvWr::new_recv(recv_b.sge(64), WorkRequestId::from_raw(2))).unwrap();

        let mut msg = Mem::new(&p.dev, 16, BitFlags::empty());
        for (i, text) in [&b"first"[..], &b"second"[..]].into_iter().enumerate() {
            msg.fill(text);
            let wr = SendWr::new_send(msg.sge(text.len().cast()), WorkRequestId::from_raw(10 + i as u64));
            p.dev.post_send(p.client, wr).unwrap();
        }

        let server_wcs = poll_all(&p.dev, p.server_cq);
        assert_eq!(server_wcs.len(), 2);
        assert_eq!(u64::from(server_wcs[0].wr_id()), 1);
        assert_eq!(server_wcs[0].result(), Ok(5));
        assert_eq!(server_wcs[1].result(), Ok(6));
        assert_eq!(recv_a.bytes(5), b"first");
        assert_eq!(recv_b.bytes(6), b"second");
        assert_eq!(poll_all(&p.dev, p.client_cq).len(), 2);

        for mem in [recv_a, recv_b, msg] {
            mem.release(&p.dev);
        }
    }

    #[test]
    fn fresh_keys_skip_the_taken_ones() {
        let mut keys = HashMap::from([(1_u32, "pool-0"), (2_u32, "pool-1"), (3_u32, "send")]);
        let mut next = 0_u32;
        let key = insert_fresh(&mut keys, "chunk", || {
            next = next.wrapping_add(1);
            next
        });
        assert_eq!(key, 4_u32);
        assert_eq!(keys.get(&1_u32), Some(&"pool-0"));
        assert_eq!(keys.get(&4_u32), Some(&"chunk"));
    }

    #[test]
    fn small_receive_reports_length_error() {
        let p = connected_pair();
        let recv = Mem::new(&p.dev, 16, AccessFlag::LocalWrite.into());
        p.dev.post_recv(p.server, RecvWr::new_recv(recv.sge(16), WorkRequestId::from_raw(1))).unwrap();
        let msg = Mem::new(&p.dev, 100, BitFlags::empty());
        p.dev.post_send(p.client, SendWr::new_send(msg.sge(100), WorkRequestId::from_raw(2))).unwrap();

        let wcs = poll_all(&p.dev, p.server_cq);
        assert_eq!(wcs[0].result(), Err(WCError::LocLenErr));
        assert_eq!(wcs[0].byte_len(), 100);
        assert_eq!(poll_all(&p.dev, p.client_cq)[0].result(), Ok(100));
        recv.release(&p.dev);
        msg.release(&p.dev);
    }

    #[test]
    fn one_sided_access_checks_key_and_bounds() {
        let p = connected_pair();
        let mut exposed = Mem::new(&p.dev, 32, AccessFlag::LocalWrite | AccessFlag::RemoteRead);
        exposed.fill(&[7_u8; 32]);
        let target = Mem::new(&p.dev, 32, AccessFlag::LocalWrite.into());
        let remote = RemoteDescriptor {
            addr: exposed.ptr as u64,
            rkey: exposed.keys.rkey,
            len: 32,
        };

        p.dev.post_send(p.server, SendWr::new_read(target.sge(32), WorkRequestId::from_raw(1), remote)).unwrap();
        assert_eq!(poll_all(&p.dev, p.server_cq)[0].result(), Ok(32));
        assert_eq!(target.bytes(32), &[7_u8; 32]);

        // one byte past the end
        let past = RemoteDescriptor { addr: remote.addr + 1, ..remote };
        p.dev.post_send(p.server, SendWr::new_read(target.sge(32), WorkRequestId::from_raw(2), past)).unwrap();
        assert_eq!(poll_all(&p.dev, p.server_cq)[0].result(), Err(WCError::RemAccessErr));

        // writes need remote write access
        p.dev.post_send(p.server, SendWr::new_write(target.sge(8), WorkRequestId::from_raw(3), remote)).unwrap();
        assert_eq!(poll_all(&p.dev, p.server_cq)[0].result(), Err(WCError::RemAccessErr));

        exposed.release(&p.dev);
        target.release(&p.dev);
    }

    #[test]
    fn disconnect_flushes_both_sides() {
        let p = connected_pair();
        let recv = Mem::new(&p.dev, 64, AccessFlag::LocalWrite.into());
        for i in 0..3 {
            p.dev.post_recv(p.server, RecvWr::new_recv(recv.sge(64), WorkRequestId::from_raw(i))).unwrap();
        }
        p.dev.disconnect(p.client).unwrap();
        let wcs = poll_all(&p.dev, p.server_cq);
        assert_eq!(wcs.len(), 3);
        assert!(wcs.iter().all(|wc| wc.result() == Err(WCError::WrFlushErr)));
        assert_eq!(p.dev.posted_receives(p.server), 0);
        // idempotent
        p.dev.disconnect(p.server).unwrap();
        recv.release(&p.dev);
    }

    #[test]
    fn armed_queue_signals_once() {
        let p = connected_pair();
        let recv = Mem::new(&p.dev, 64, AccessFlag::LocalWrite.into());
        let msg = Mem::new(&p.dev, 8, BitFlags::empty());
        p.dev.req_notify_cq(p.server_cq, false).unwrap();
        for i in 0..2 {
            p.dev.post_recv(p.server, RecvWr::new_recv(recv.sge(64), WorkRequestId::from_raw(i))).unwrap();
            p.dev.post_send(p.client, SendWr::new_send(msg.sge(8), WorkRequestId::from_raw(10 + i))).unwrap();
        }
        assert!(p.dev.get_cq_event(p.server_cq).unwrap());
        assert!(!p.dev.get_cq_event(p.server_cq).unwrap());
        assert_eq!(p.dev.unacked_cq_events(p.server_cq), 1);
        p.dev.ack_cq_events(p.server_cq, 1);
        assert_eq!(p.dev.unacked_cq_events(p.server_cq), 0);
        recv.release(&p.dev);
        msg.release(&p.dev);
    }

    #[test]
    fn unknown_address_does_not_resolve() {
        let dev = LoopbackProvider::new();
        let ch = dev.create_cm_channel().unwrap();
        let id = dev.create_id(ch).unwrap();
        let err = dev
            .resolve_addr(id, "10.9.9.9:1".parse().unwrap(), Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }

    #[test]
    fn deregistration_purges_posted_receives() {
        let p = connected_pair();
        let recv = Mem::new(&p.dev, 64, AccessFlag::LocalWrite.into());
        p.dev.post_recv(p.server, RecvWr::new_recv(recv.sge(64), WorkRequestId::from_raw(1))).unwrap();
        assert_eq!(p.dev.posted_receives(p.server), 1);
        recv.release(&p.dev);
        assert_eq!(p.dev.posted_receives(p.server), 0);
        assert_eq!(p.dev.registered_regions(), 0);
    }
}
