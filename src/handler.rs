use crate::{
    connection::{ConnectionCtx, ConnectionId, ConnectionStats},
    error::Result,
    memory_region::RemoteDescriptor,
    remote_access::{RemoteAccessHeader, RemoteOp},
};
use std::{collections::VecDeque, fmt::Debug};
use tracing::{debug, trace};

/// Reply of the stock handler
const DEFAULT_REPLY: &[u8] = b"hello client!\n";

/// Commands carrying this word expect no reply
const NOREPLY: &[u8] = b"noreply";

/// A successful completion as a handler sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion<'a> {
    /// A message arrived. The buffer is re-posted once the handler returns.
    Receive {
        /// Exactly the received bytes
        data: &'a [u8],
    },
    /// A send finished
    Send {
        /// Bytes sent
        len: usize,
    },
    /// A one-sided read finished
    RemoteRead {
        /// Exactly the bytes read
        data: &'a [u8],
        /// The region that was read
        remote: RemoteDescriptor,
    },
    /// A one-sided write finished
    RemoteWrite {
        /// Bytes written
        len: usize,
        /// The region that was written
        remote: RemoteDescriptor,
    },
}

/// Per-connection callbacks, driven by the worker that owns the connection.
///
/// Handlers never post receives: the worker re-posts the receive buffer after
/// `on_completion` returns. An error of kind `Protocol` drops the offending message, any
/// other error disconnects.
pub trait ConnectionHandler: Send + Debug {
    /// The connection became usable
    #[inline]
    fn on_established(&mut self, _ctx: &mut ConnectionCtx<'_>) -> Result<()> {
        Ok(())
    }

    /// A work request of the connection completed successfully
    fn on_completion(&mut self, ctx: &mut ConnectionCtx<'_>, completion: Completion<'_>) -> Result<()>;

    /// The connection is gone, its buffers are released next
    #[inline]
    fn on_disconnected(&mut self, _stats: &ConnectionStats) {}
}

/// Creates the handler of every connection a listener accepts
pub type HandlerFactory = Box<dyn FnMut(ConnectionId) -> Box<dyn ConnectionHandler> + Send>;

/// Whether a command asks for no reply
fn wants_reply(command: &[u8]) -> bool {
    !command.windows(NOREPLY.len()).any(|w| w == NOREPLY)
}

/// The benchmark server's handler.
///
/// Replies with a canned message to every command without `noreply`. A remote-access
/// header makes it read the announced region, or write its reply into it, and reply once
/// the one-sided operation finished.
#[derive(Debug, Clone)]
pub struct ReplyingHandler {
    /// The canned reply
    reply: Vec<u8>,
    /// Whether a reply is owed for each one-sided operation in flight
    pending: VecDeque<bool>,
}

impl Default for ReplyingHandler {
    #[inline]
    fn default() -> Self {
        Self::with_reply(DEFAULT_REPLY)
    }
}

impl ReplyingHandler {
    /// Create a handler replying with `reply`
    #[inline]
    pub fn with_reply(reply: impl Into<Vec<u8>>) -> Self {
        Self {
            reply: reply.into(),
            pending: VecDeque::new(),
        }
    }

    /// Reply if the finished one-sided operation owes one
    fn settle(&mut self, ctx: &mut ConnectionCtx<'_>) -> Result<()> {
        if self.pending.pop_front().unwrap_or(false) {
            ctx.send(&self.reply)?;
        }
        Ok(())
    }
}

impl ConnectionHandler for ReplyingHandler {
    fn on_completion(&mut self, ctx: &mut ConnectionCtx<'_>, completion: Completion<'_>) -> Result<()> {
        match completion {
            Completion::Receive { data } => match RemoteAccessHeader::parse(data)? {
                Some(header) => {
                    debug!(
                        "{} asks for {:?} of {} bytes",
                        ctx.id(),
                        header.op,
                        header.remote.len
                    );
                    match header.op {
                        RemoteOp::ReadFromMe => ctx.read_remote(header.remote)?,
                        RemoteOp::WriteIntoMe => ctx.write_remote(&self.reply, header.remote)?,
                    }
                    self.pending.push_back(wants_reply(header.command));
                }
                None => {
                    if wants_reply(data) {
                        ctx.send(&self.reply)?;
                    } else {
                        trace!("{} no reply for {} bytes", ctx.id(), data.len());
                    }
                }
            },
            Completion::RemoteRead { data, .. } => {
                trace!("{} read {} remote bytes", ctx.id(), data.len());
                self.settle(ctx)?;
            }
            Completion::RemoteWrite { len, .. } => {
                trace!("{} wrote {} remote bytes", ctx.id(), len);
                self.settle(ctx)?;
            }
            Completion::Send { .. } => {}
        }
        Ok(())
    }

    fn on_disconnected(&mut self, stats: &ConnectionStats) {
        debug!(
            "replying handler done, {} received, {} sent",
            stats.total_recv, stats.total_sent
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noreply_is_found_anywhere_in_the_command() {
        assert!(wants_reply(b"get foo\r\n"));
        assert!(!wants_reply(b"set foo 0 0 3 noreply\r\nbar\r\n"));
        assert!(!wants_reply(b"noreply"));
        assert!(wants_reply(b"norepl"));
    }
}
