use crate::{chunked::DEFAULT_CHUNK_SIZE, dispatcher::PollingTriggerType, impl_from_builder_error};
use clippy_utilities::Cast;
use derive_builder::Builder;
use getset::CopyGetters;
use std::time::Duration;

/// Default number of receive buffers per pool
pub(crate) const DEFAULT_POOL_SIZE: usize = 128;
/// Default size of one receive buffer
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 1024;
/// Default size of the dedicated send buffer
pub(crate) const DEFAULT_SEND_BUFFER_SIZE: usize = 128;
/// Default completion queue size
pub(crate) const DEFAULT_CQ_SIZE: u32 = 1024;
/// Default send queue depth
pub(crate) const DEFAULT_MAX_SEND_WR: u32 = 8;
/// Default receive queue depth
pub(crate) const DEFAULT_MAX_RECV_WR: u32 = 1024;
/// Default number of completions polled per pass
pub(crate) const DEFAULT_POLL_BATCH: usize = 128;
/// Default number of channel events acknowledged at once
pub(crate) const DEFAULT_ACK_BATCH: u32 = 16;
/// Default factor applied to the buffer size for oversize buffers
pub(crate) const DEFAULT_OVERSIZE_GROWTH: usize = 20;
/// Default timeout of address and route resolution
pub(crate) const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_millis(100);
/// Default bound on one wait for a completion-channel event
pub(crate) const DEFAULT_CC_EVENT_TIMEOUT: Duration = Duration::from_millis(100);
/// Default number of connections the registry is sized for
pub(crate) const DEFAULT_EXPECTED_CONNECTIONS: usize = 1024;
/// Default shared receive queue depth
pub(crate) const DEFAULT_SRQ_SIZE: u32 = 1024;
/// Default listen backlog
pub(crate) const DEFAULT_BACKLOG: u32 = 1024;

/// Configuration of one worker.
///
/// ```
/// use rdma_kv_engine::EngineConfigBuilder;
///
/// let config = EngineConfigBuilder::default()
///     .pool_size(16_usize)
///     .buffer_size(4096_usize)
///     .build()
///     .unwrap();
/// assert_eq!(config.pool_size(), 16);
/// assert_eq!(config.ack_batch(), 16);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder, CopyGetters)]
#[builder(derive(Debug, Copy), build_fn(validate = "Self::validate"))]
#[getset(get_copy = "pub")]
pub struct EngineConfig {
    /// Receive buffers per connection, or in the shared pool
    #[builder(default = "DEFAULT_POOL_SIZE")]
    pool_size: usize,
    /// Size of one receive buffer
    #[builder(default = "DEFAULT_BUFFER_SIZE")]
    buffer_size: usize,
    /// Size of the dedicated send buffer, the largest message `send` accepts
    #[builder(default = "DEFAULT_SEND_BUFFER_SIZE")]
    send_buffer_size: usize,
    /// Completion queue size
    #[builder(default = "DEFAULT_CQ_SIZE")]
    cq_size: u32,
    /// Maximum outstanding sends per connection
    #[builder(default = "DEFAULT_MAX_SEND_WR")]
    max_send_wr: u32,
    /// Receive queue depth of a connection
    #[builder(default = "DEFAULT_MAX_RECV_WR")]
    max_recv_wr: u32,
    /// Completions polled per pass
    #[builder(default = "DEFAULT_POLL_BATCH")]
    poll_batch: usize,
    /// Channel events acknowledged at once
    #[builder(default = "DEFAULT_ACK_BATCH")]
    ack_batch: u32,
    /// Oversize buffers get at least `buffer_size * oversize_growth` bytes
    #[builder(default = "DEFAULT_OVERSIZE_GROWTH")]
    oversize_growth: usize,
    /// Segment size of chunked sends.
    ///
    /// Every segment is one message, so the receiving side needs a `buffer_size` of at
    /// least `chunk_size`. With the defaults (1 KiB buffers, 16 KiB chunks) each segment
    /// completes as too large for its receive buffer and is dropped.
    #[builder(default = "DEFAULT_CHUNK_SIZE")]
    chunk_size: usize,
    /// Timeout of address and of route resolution
    #[builder(default = "DEFAULT_RESOLVE_TIMEOUT")]
    resolve_timeout: Duration,
    /// Bound on one wait for a channel event, the dispatcher polls after it
    #[builder(default = "DEFAULT_CC_EVENT_TIMEOUT")]
    cc_event_timeout: Duration,
    /// Connections the registry is sized for
    #[builder(default = "DEFAULT_EXPECTED_CONNECTIONS")]
    expected_connections: usize,
    /// Whether connections receive through one shared receive queue
    #[builder(default = "false")]
    shared_receive_queue: bool,
    /// Shared receive queue depth
    #[builder(default = "DEFAULT_SRQ_SIZE")]
    srq_size: u32,
    /// What wakes the dispatcher
    #[builder(default)]
    polling_trigger: PollingTriggerType,
    /// Listen backlog
    #[builder(default = "DEFAULT_BACKLOG")]
    backlog: u32,
}

impl Default for EngineConfig {
    #[inline]
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            cq_size: DEFAULT_CQ_SIZE,
            max_send_wr: DEFAULT_MAX_SEND_WR,
            max_recv_wr: DEFAULT_MAX_RECV_WR,
            poll_batch: DEFAULT_POLL_BATCH,
            ack_batch: DEFAULT_ACK_BATCH,
            oversize_growth: DEFAULT_OVERSIZE_GROWTH,
            chunk_size: DEFAULT_CHUNK_SIZE,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            cc_event_timeout: DEFAULT_CC_EVENT_TIMEOUT,
            expected_connections: DEFAULT_EXPECTED_CONNECTIONS,
            shared_receive_queue: false,
            srq_size: DEFAULT_SRQ_SIZE,
            polling_trigger: PollingTriggerType::default(),
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl EngineConfig {
    /// Size of an oversize buffer for a receive of `observed` bytes
    #[inline]
    #[must_use]
    pub fn oversize_len(&self, observed: usize) -> usize {
        observed.max(self.buffer_size.saturating_mul(self.oversize_growth))
    }
}

impl EngineConfigBuilder {
    /// Check the combination of fields
    fn validate(&self) -> Result<(), String> {
        let nonzero = [
            ("pool_size", self.pool_size.unwrap_or(DEFAULT_POOL_SIZE)),
            ("buffer_size", self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE)),
            (
                "send_buffer_size",
                self.send_buffer_size.unwrap_or(DEFAULT_SEND_BUFFER_SIZE),
            ),
            ("poll_batch", self.poll_batch.unwrap_or(DEFAULT_POLL_BATCH)),
            ("chunk_size", self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)),
            (
                "oversize_growth",
                self.oversize_growth.unwrap_or(DEFAULT_OVERSIZE_GROWTH),
            ),
        ];
        if let Some((name, _)) = nonzero.iter().find(|&&(_, value)| value == 0) {
            return Err(format!("{name} must not be zero"));
        }
        if self.max_send_wr.unwrap_or(DEFAULT_MAX_SEND_WR) == 0 {
            return Err("max_send_wr must not be zero".to_owned());
        }
        if self.ack_batch.unwrap_or(DEFAULT_ACK_BATCH) == 0 {
            return Err("ack_batch must not be zero".to_owned());
        }
        if self.cq_size.unwrap_or(DEFAULT_CQ_SIZE) == 0 {
            return Err("cq_size must not be zero".to_owned());
        }
        let pool_size = self.pool_size.unwrap_or(DEFAULT_POOL_SIZE);
        let (depth_name, depth) = if self.shared_receive_queue.unwrap_or(false) {
            ("srq_size", self.srq_size.unwrap_or(DEFAULT_SRQ_SIZE))
        } else {
            ("max_recv_wr", self.max_recv_wr.unwrap_or(DEFAULT_MAX_RECV_WR))
        };
        let depth: usize = depth.cast();
        // every pool slot is posted at once, grown buffers reuse their slot
        if depth < pool_size {
            return Err(format!(
                "{depth_name} {depth} can not hold pool_size {pool_size}"
            ));
        }
        Ok(())
    }
}

impl_from_builder_error!(EngineConfigBuilderError);
