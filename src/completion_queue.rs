use crate::work_context::WorkRequestId;
use clippy_utilities::Cast;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::io;
use thiserror::Error;

/// Status value of a successful completion
const WC_SUCCESS: u32 = 0;

/// Bit set in the opcode of every receive-side completion
const WC_RECV_FLAG: u32 = 128;

/// Opcode of a work completion
#[derive(Debug, FromPrimitive, Copy, Clone, PartialEq, Eq)]
pub enum WcOpcode {
    /// Send completed
    Send = 0,
    /// One-sided write completed
    RdmaWrite = 1,
    /// One-sided read completed
    RdmaRead = 2,
    /// Compare and swap completed
    CompSwap = 3,
    /// Fetch and add completed
    FetchAdd = 4,
    /// Memory window bind completed
    BindMw = 5,
    /// Receive completed
    Recv = 128,
    /// Receive of a write with immediate completed
    RecvRdmaWithImm = 129,
}

/// Work Completion
///
/// Plain data reported by the transport provider for one finished work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// Id of the work request, as posted
    wr_id: u64,
    /// Raw completion status, 0 on success
    status: u32,
    /// Raw completion opcode
    opcode: u32,
    /// Number of bytes transferred (receives) or requested (sends)
    byte_len: u32,
    /// Endpoint (queue pair number) the work request belongs to
    qp_num: u32,
}

impl WorkCompletion {
    /// Create a successful completion
    #[inline]
    #[must_use]
    pub fn success(wr_id: u64, opcode: WcOpcode, byte_len: u32, qp_num: u32) -> Self {
        Self {
            wr_id,
            status: WC_SUCCESS,
            opcode: opcode as u32,
            byte_len,
            qp_num,
        }
    }

    /// Create a failed completion
    #[inline]
    #[must_use]
    pub fn failed(wr_id: u64, opcode: WcOpcode, err: WCError, byte_len: u32, qp_num: u32) -> Self {
        Self {
            wr_id,
            status: err as u32,
            opcode: opcode as u32,
            byte_len,
            qp_num,
        }
    }

    /// Create a completion from raw status and opcode values
    #[inline]
    #[must_use]
    pub const fn from_raw(wr_id: u64, status: u32, opcode: u32, byte_len: u32, qp_num: u32) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len,
            qp_num,
        }
    }

    /// Get work request Id
    #[inline]
    #[must_use]
    pub const fn wr_id(&self) -> WorkRequestId {
        WorkRequestId::from_raw(self.wr_id)
    }

    /// Get the endpoint number the completion belongs to
    #[inline]
    #[must_use]
    pub const fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// Get the byte length carried by the completion, valid on failure too
    #[inline]
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.byte_len.cast()
    }

    /// Get the opcode, `None` for values this engine does not know
    #[inline]
    #[must_use]
    pub fn opcode(&self) -> Option<WcOpcode> {
        WcOpcode::from_u32(self.opcode)
    }

    /// Whether the completion belongs to the receive side
    #[inline]
    #[must_use]
    pub const fn is_recv(&self) -> bool {
        self.opcode & WC_RECV_FLAG != 0
    }

    /// Get work completion result.
    /// Returns the length on success otherwise returns an error.
    #[inline]
    pub fn result(&self) -> Result<usize, WCError> {
        if self.status == WC_SUCCESS {
            Ok(self.byte_len.cast())
        } else {
            Err(WCError::from_u32(self.status).unwrap_or(WCError::UnexpectedErr))
        }
    }
}

/// Wrapper for work completion error
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Error, Debug, FromPrimitive, Copy, Clone, PartialEq, Eq)]
pub enum WCError {
    #[error("Local Length Error: a Work Request posted in a local Receive Queue isn't big enough for holding the incoming message, or a posted message is greater than the maximum message size supported by the port.")]
    LocLenErr = 1,
    #[error("Local QP Operation Error: an internal QP consistency error was detected while processing this Work Request.")]
    LocQpOpErr = 2,
    #[error("Local EE Context Operation Error: an internal EE Context consistency error was detected while processing this Work Request.")]
    LocEecOpErr = 3,
    #[error("Local Protection Error: the locally posted Work Request's buffers in the scatter/gather list does not reference a Memory Region that is valid for the requested operation.")]
    LocProtErr = 4,
    #[error("Work Request Flushed Error: A Work Request was in process or outstanding when the QP transitioned into the Error State.")]
    WrFlushErr = 5,
    #[error("Memory Window Binding Error: A failure happened when tried to bind a MW to a MR.")]
    MwBindErr = 6,
    #[error("Bad Response Error: an unexpected transport layer opcode was returned by the responder.")]
    BadRespErr = 7,
    #[error("Local Access Error: a protection error occurred on a local data buffer during the processing of a write with immediate sent from the remote node.")]
    LocAccessErr = 8,
    #[error("Remote Invalid Request Error: The responder detected an invalid message on the channel.")]
    RemInvReqErr = 9,
    #[error("Remote Access Error: a protection error occurred on a remote data buffer to be read by a one-sided read or written by a one-sided write.")]
    RemAccessErr = 10,
    #[error("Remote Operation Error: the operation could not be completed successfully by the responder.")]
    RemOpErr = 11,
    #[error("Transport Retry Counter Exceeded: the remote side didn't send any Ack or Nack.")]
    RetryExc = 12,
    #[error("RNR Retry Counter Exceeded: the remote side didn't post any WR to its Receive Queue.")]
    RnrRetryExc = 13,
    #[error("Local RDD Violation Error.")]
    LocRddViolErr = 14,
    #[error("Remote Invalid RD Request.")]
    RemInvRdReq = 15,
    #[error("Remote Aborted Error: the responder aborted the operation.")]
    RemAbortErr = 16,
    #[error("Invalid EE Context Number.")]
    InvEecn = 17,
    #[error("Invalid EE Context State Error.")]
    InvEecState = 18,
    #[error("Fatal Error.")]
    Fatal = 19,
    #[error("Response Timeout Error.")]
    RespTimeout = 20,
    #[error("General Error: other error which isn't one of the above errors.")]
    GeneralErr = 21,
    #[error("Unexpected Error.")]
    UnexpectedErr = 100,
}

impl From<WCError> for io::Error {
    #[inline]
    fn from(e: WCError) -> Self {
        Self::new(io::ErrorKind::Other, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_maps_status() {
        let ok = WorkCompletion::success(7, WcOpcode::Recv, 27, 3);
        assert_eq!(ok.result(), Ok(27));
        assert!(ok.is_recv());
        assert_eq!(ok.opcode(), Some(WcOpcode::Recv));

        let short = WorkCompletion::failed(8, WcOpcode::Recv, WCError::LocLenErr, 5000, 3);
        assert_eq!(short.result(), Err(WCError::LocLenErr));
        assert_eq!(short.byte_len(), 5000);
    }

    #[test]
    fn unknown_values_are_tolerated() {
        let wc = WorkCompletion::from_raw(1, 77, 42, 0, 1);
        assert_eq!(wc.result(), Err(WCError::UnexpectedErr));
        assert_eq!(wc.opcode(), None);
        assert!(!wc.is_recv());
        assert!(WorkCompletion::success(1, WcOpcode::RecvRdmaWithImm, 0, 1).is_recv());
        assert!(!WorkCompletion::success(1, WcOpcode::RdmaRead, 0, 1).is_recv());
    }
}
