use crate::{
    completion_queue::WorkCompletion,
    config::EngineConfig,
    error::Result,
    provider::{CqId, TransportProvider},
};
use async_trait::async_trait;
use clippy_utilities::Cast;
use std::{io, os::unix::prelude::RawFd, time::Duration};
use tokio::{
    io::unix::AsyncFd,
    sync::mpsc::{Receiver, Sender},
    time::timeout,
};
use tracing::{debug, error, trace};

/// The trigger of polling.
#[async_trait]
pub(crate) trait PollingTrigger: Send {
    /// Wait for the trigger.
    /// Return `Ok` to poll.
    /// Return `Err` to record error message and stop polling
    async fn call(&mut self) -> io::Result<()>;
}

/// A trigger that listens to a readiness fd of the provider asynchronously.
pub(crate) struct AsyncFdTrigger {
    /// Associates the fd with the tokio reactor, allowing for readiness to be polled.
    async_fd: AsyncFd<RawFd>,
}

impl AsyncFdTrigger {
    /// Watch `fd`, which must be non-blocking and outlive the trigger
    pub(crate) fn new(fd: RawFd) -> io::Result<Self> {
        Ok(Self {
            async_fd: AsyncFd::new(fd)?,
        })
    }
}

#[async_trait]
impl PollingTrigger for AsyncFdTrigger {
    async fn call(&mut self) -> io::Result<()> {
        self.async_fd.readable().await?.clear_ready();
        Ok(())
    }
}

/// A trigger that uses the mpsc receiver to wait for the sender's msg before polling.
pub(crate) struct ChannelTrigger {
    /// Receiver that wait for the sender's msg
    rx: Receiver<()>,
}

impl ChannelTrigger {
    /// Wait on `rx`
    pub(crate) const fn new(rx: Receiver<()>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl PollingTrigger for ChannelTrigger {
    async fn call(&mut self) -> io::Result<()> {
        self.rx.recv().await.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                "the channel of `ChannelTrigger` was closed",
            )
        })
    }
}

/// A trigger that fires after yielding to the runtime once
pub(crate) struct BusyPollTrigger;

#[async_trait]
impl PollingTrigger for BusyPollTrigger {
    async fn call(&mut self) -> io::Result<()> {
        tokio::task::yield_now().await;
        Ok(())
    }
}

/// Type of polling trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingTriggerType {
    /// Listen to the completion channel of the cq and poll on its events.
    Automatic,
    /// Poll only when the application pulls the `ManualTrigger`.
    Manual,
    /// Poll continuously, yielding to the runtime between passes.
    BusyPoll,
}

impl Default for PollingTriggerType {
    #[inline]
    fn default() -> Self {
        Self::Automatic
    }
}

/// Manual polling trigger.
///
/// Pull this trigger to make a worker configured with `PollingTriggerType::Manual` poll.
#[derive(Debug, Clone)]
pub struct ManualTrigger(pub Sender<()>);

impl ManualTrigger {
    /// Pull the trigger to do a polling.
    #[inline]
    pub async fn pull(&self) -> io::Result<()> {
        self.0.send(()).await.map_err(|_e| {
            io::Error::new(io::ErrorKind::BrokenPipe, "the polling worker is gone")
        })
    }
}

/// Build the trigger of a worker.
///
/// `fd` is the completion channel of the provider; without one, automatic polling
/// falls back to the protective timeout alone.
pub(crate) fn build_trigger(
    kind: PollingTriggerType,
    fd: Option<RawFd>,
    manual: Option<Receiver<()>>,
) -> io::Result<Box<dyn PollingTrigger>> {
    match (kind, fd, manual) {
        (PollingTriggerType::Automatic, Some(fd), _) => Ok(Box::new(AsyncFdTrigger::new(fd)?)),
        (PollingTriggerType::Automatic, None, _) => {
            debug!("provider has no completion channel fd, polling on timeout only");
            Ok(Box::new(TimeoutOnlyTrigger))
        }
        (PollingTriggerType::Manual, _, Some(rx)) => Ok(Box::new(ChannelTrigger::new(rx))),
        (PollingTriggerType::Manual, _, None) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "manual polling needs the receiver of a `ManualTrigger`",
        )),
        (PollingTriggerType::BusyPoll, _, _) => Ok(Box::new(BusyPollTrigger)),
    }
}

/// A trigger that never fires, the protective timeout drives polling
struct TimeoutOnlyTrigger;

#[async_trait]
impl PollingTrigger for TimeoutOnlyTrigger {
    async fn call(&mut self) -> io::Result<()> {
        futures::future::pending::<()>().await;
        Ok(())
    }
}

/// Wait for `trigger`, at most `cc_event_timeout`
pub(crate) async fn wait_trigger(
    trigger: &mut dyn PollingTrigger,
    cc_event_timeout: Duration,
) -> io::Result<()> {
    timeout(cc_event_timeout, trigger.call()).await.map_or_else(
        |_| {
            debug!("poll protectively");
            Ok(())
        },
        |trigger_res| {
            trigger_res.map_err(|e| {
                error! {"polling trigger error: {:?}", e};
                e
            })
        },
    )
}

/// Counters of a dispatcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Completion-channel events consumed
    pub wakes: u64,
    /// Polling passes
    pub passes: u64,
    /// Completions routed
    pub completions: u64,
    /// Acknowledgment calls
    pub acks: u64,
}

/// Consumes the events and completions of one completion queue
#[derive(Debug)]
pub(crate) struct CompletionDispatcher {
    /// The completion queue
    cq: CqId,
    /// Completions per polling pass
    poll_batch: usize,
    /// Events acknowledged at once
    ack_batch: u32,
    /// Consumed events not acknowledged yet
    unacked: u32,
    /// Polling buffer
    wc_buf: Vec<WorkCompletion>,
    /// Counters
    stats: DispatchStats,
}

impl CompletionDispatcher {
    /// Dispatcher of `cq`
    pub(crate) fn new(cq: CqId, config: &EngineConfig) -> Self {
        Self {
            cq,
            poll_batch: config.poll_batch(),
            ack_batch: config.ack_batch(),
            unacked: 0,
            wc_buf: Vec::with_capacity(config.poll_batch()),
            stats: DispatchStats::default(),
        }
    }

    /// The completion queue
    pub(crate) const fn cq(&self) -> CqId {
        self.cq
    }

    /// Counters
    pub(crate) const fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Consume one channel event, acknowledging in batches.
    ///
    /// Returns whether an event was pending.
    pub(crate) fn take_event(&mut self, provider: &dyn TransportProvider) -> Result<bool> {
        if !provider.get_cq_event(self.cq)? {
            return Ok(false);
        }
        self.stats.wakes = self.stats.wakes.saturating_add(1);
        self.unacked = self.unacked.saturating_add(1);
        if self.unacked >= self.ack_batch {
            self.flush_acks(provider);
        }
        Ok(true)
    }

    /// Acknowledge every consumed event
    pub(crate) fn flush_acks(&mut self, provider: &dyn TransportProvider) {
        if self.unacked == 0 {
            return;
        }
        provider.ack_cq_events(self.cq, self.unacked);
        trace!("acked {} events of {:?}", self.unacked, self.cq);
        self.unacked = 0;
        self.stats.acks = self.stats.acks.saturating_add(1);
    }

    /// Request an event for the next completion
    pub(crate) fn rearm(&self, provider: &dyn TransportProvider) -> Result<()> {
        provider.req_notify_cq(self.cq, false).map_err(|e| {
            error!(
                "Failed to request a notification on next cq arrival, {:?}",
                e
            );
            e.into()
        })
    }

    /// Poll in passes of `poll_batch`, repeating while a pass comes back full, and hand
    /// every completion to `route` in queue order.
    ///
    /// Returns the number of completions routed.
    pub(crate) fn drain<F: FnMut(WorkCompletion)>(
        &mut self,
        provider: &dyn TransportProvider,
        mut route: F,
    ) -> Result<usize> {
        let mut total = 0_usize;
        loop {
            self.wc_buf.clear();
            let n = provider.poll_cq(self.cq, self.poll_batch, &mut self.wc_buf)?;
            self.stats.passes = self.stats.passes.saturating_add(1);
            for wc in self.wc_buf.drain(..) {
                route(wc);
            }
            total = total.saturating_add(n);
            if n < self.poll_batch {
                break;
            }
        }
        let routed: u64 = total.cast();
        self.stats.completions = self.stats.completions.saturating_add(routed);
        Ok(total)
    }
}
