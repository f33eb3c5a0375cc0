/// Nonblocking eventfd used as a readiness source
pub(crate) mod event_fd;
/// In-process reliable-connected provider
pub mod loopback;

use crate::{
    access::AccessFlag,
    completion_queue::WorkCompletion,
    memory_region::MrKeys,
    work_request::{RecvWr, SendWr},
};
use enumflags2::BitFlags;
use std::{fmt, io, net::SocketAddr, os::unix::prelude::RawFd, time::Duration};

/// Endpoint (queue pair) number, unique per provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u32);

impl fmt::Display for EndpointId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qp#{}", self.0)
    }
}

/// Completion queue id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CqId(pub u32);

/// Shared receive queue id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SrqId(pub u32);

/// Connection-manager event channel id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmChannelId(pub u32);

/// Kind of a connection-manager event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    /// A peer asks a listener for a connection; `endpoint` is the new server-side endpoint
    ConnectRequest,
    /// The connection is usable
    Established,
    /// The connection went down, outstanding work has been flushed
    Disconnected,
    /// Address resolution failed
    AddrError,
    /// Route resolution failed
    RouteError,
    /// The connection attempt failed
    ConnectError,
    /// The peer can not be reached
    Unreachable,
    /// The peer rejected the connection
    Rejected,
}

/// Connection-manager event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmEvent {
    /// What happened
    pub kind: CmEventKind,
    /// Endpoint the event is about
    pub endpoint: EndpointId,
    /// Listening endpoint, set on connect requests
    pub listener: Option<EndpointId>,
}

/// Attributes of a queue pair bound to an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    /// Completion queue for both directions
    pub cq: CqId,
    /// Shared receive queue, replaces the endpoint's own receive queue
    pub srq: Option<SrqId>,
    /// Maximum outstanding send-queue work requests
    pub max_send_wr: u32,
    /// Maximum outstanding receive-queue work requests
    pub max_recv_wr: u32,
}

/// The transport the engine runs on.
///
/// Device, protection-domain and queue bring-up live behind this trait; the engine only
/// uses the operations below. All calls are non-blocking except address and route
/// resolution, which are bounded by the given timeout. Failures are reported as
/// `io::Error`s and mapped onto engine error kinds by the caller.
pub trait TransportProvider: Send + Sync + fmt::Debug {
    /// Create a connection-manager event channel
    fn create_cm_channel(&self) -> io::Result<CmChannelId>;

    /// Readiness fd of a connection-manager channel, if the provider has one
    fn cm_channel_fd(&self, channel: CmChannelId) -> Option<RawFd>;

    /// Take the next connection-manager event, `None` when there is none
    fn get_cm_event(&self, channel: CmChannelId) -> io::Result<Option<CmEvent>>;

    /// Create an endpoint whose events are delivered on `channel`
    fn create_id(&self, channel: CmChannelId) -> io::Result<EndpointId>;

    /// Listen on `addr`
    fn listen(&self, id: EndpointId, addr: SocketAddr, backlog: u32) -> io::Result<()>;

    /// Resolve `addr` within `timeout`
    fn resolve_addr(&self, id: EndpointId, addr: SocketAddr, timeout: Duration) -> io::Result<()>;

    /// Resolve the route to the resolved address within `timeout`
    fn resolve_route(&self, id: EndpointId, timeout: Duration) -> io::Result<()>;

    /// Create the queue pair of an endpoint
    fn create_qp(&self, id: EndpointId, attr: &QpInitAttr) -> io::Result<()>;

    /// Start connecting a resolved endpoint
    fn connect(&self, id: EndpointId) -> io::Result<()>;

    /// Accept a connect request
    fn accept(&self, id: EndpointId) -> io::Result<()>;

    /// Reject a connect request
    fn reject(&self, id: EndpointId) -> io::Result<()>;

    /// Disconnect, flushing outstanding work on both sides
    fn disconnect(&self, id: EndpointId) -> io::Result<()>;

    /// Destroy an endpoint and its queue pair
    fn destroy_id(&self, id: EndpointId) -> io::Result<()>;

    /// Create a completion queue with its completion channel
    fn create_cq(&self, size: u32) -> io::Result<CqId>;

    /// Destroy a completion queue
    fn destroy_cq(&self, cq: CqId) -> io::Result<()>;

    /// Create a shared receive queue
    fn create_srq(&self, max_wr: u32) -> io::Result<SrqId>;

    /// Destroy a shared receive queue
    fn destroy_srq(&self, srq: SrqId) -> io::Result<()>;

    /// Register `len` bytes at `addr`
    fn register(&self, addr: usize, len: usize, access: BitFlags<AccessFlag>) -> io::Result<MrKeys>;

    /// Deregister a registration
    fn deregister(&self, keys: MrKeys) -> io::Result<()>;

    /// Post a receive on an endpoint
    fn post_recv(&self, id: EndpointId, wr: RecvWr) -> io::Result<()>;

    /// Post a receive on a shared receive queue
    fn post_srq_recv(&self, srq: SrqId, wr: RecvWr) -> io::Result<()>;

    /// Post a send, one-sided read or one-sided write on an endpoint
    fn post_send(&self, id: EndpointId, wr: SendWr) -> io::Result<()>;

    /// Move at most `max` completions into `out`, returning how many were moved
    fn poll_cq(&self, cq: CqId, max: usize, out: &mut Vec<WorkCompletion>) -> io::Result<usize>;

    /// Request a channel event on the next completion
    fn req_notify_cq(&self, cq: CqId, solicited_only: bool) -> io::Result<()>;

    /// Consume one completion-channel event, `false` when none is pending
    fn get_cq_event(&self, cq: CqId) -> io::Result<bool>;

    /// Acknowledge `count` consumed completion-channel events
    fn ack_cq_events(&self, cq: CqId, count: u32);

    /// Readiness fd of a completion channel, if the provider has one
    fn cq_channel_fd(&self, cq: CqId) -> Option<RawFd>;
}
