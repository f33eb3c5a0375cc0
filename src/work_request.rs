use crate::{memory_region::RemoteDescriptor, work_context::WorkRequestId};

/// Scatter/gather entry: one piece of registered local memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    /// Start address
    pub addr: u64,
    /// Length in bytes
    pub length: u32,
    /// Local key of the registration covering the range
    pub lkey: u32,
}

/// Opcode of a send-queue work request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOpcode {
    /// Two-sided send, consumes a posted receive on the peer
    Send,
    /// One-sided read from the peer's registered memory into `sge`
    RdmaRead,
    /// One-sided write of `sge` into the peer's registered memory
    RdmaWrite,
}

/// Send-queue work request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    /// Id echoed in the completion
    pub wr_id: WorkRequestId,
    /// What to do
    pub opcode: SendOpcode,
    /// Local memory
    pub sge: Sge,
    /// Remote memory, for one-sided operations
    pub remote: Option<RemoteDescriptor>,
    /// Whether a completion is generated
    pub signaled: bool,
}

impl SendWr {
    /// A signaled two-sided send of `sge`
    #[inline]
    #[must_use]
    pub const fn new_send(sge: Sge, wr_id: WorkRequestId) -> Self {
        Self {
            wr_id,
            opcode: SendOpcode::Send,
            sge,
            remote: None,
            signaled: true,
        }
    }

    /// A signaled one-sided read of `remote` into `sge`
    #[inline]
    #[must_use]
    pub const fn new_read(sge: Sge, wr_id: WorkRequestId, remote: RemoteDescriptor) -> Self {
        Self {
            wr_id,
            opcode: SendOpcode::RdmaRead,
            sge,
            remote: Some(remote),
            signaled: true,
        }
    }

    /// A signaled one-sided write of `sge` into `remote`
    #[inline]
    #[must_use]
    pub const fn new_write(sge: Sge, wr_id: WorkRequestId, remote: RemoteDescriptor) -> Self {
        Self {
            wr_id,
            opcode: SendOpcode::RdmaWrite,
            sge,
            remote: Some(remote),
            signaled: true,
        }
    }
}

/// Receive-queue work request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    /// Id echoed in the completion
    pub wr_id: WorkRequestId,
    /// Memory the incoming message lands in
    pub sge: Sge,
}

impl RecvWr {
    /// A receive into `sge`
    #[inline]
    #[must_use]
    pub const fn new_recv(sge: Sge, wr_id: WorkRequestId) -> Self {
        Self { wr_id, sge }
    }
}
