use parking_lot::Mutex;
use portpicker::pick_unused_port;
use rdma_kv_engine::{
    Completion, ConnectionCtx, ConnectionHandler, ConnectionId, ConnectionStats, EngineConfig, HandlerFactory,
    LoopbackProvider, RemoteDescriptor, Result, TransportProvider, WorkerContext,
};
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

/// Upper bound of pump rounds, a test that needs more is stuck
const MAX_PUMP_ROUNDS: usize = 64;

/// What a `Recorder` saw
#[derive(Debug, Default)]
#[allow(unused)] // not every test reads every field
pub(crate) struct Log {
    pub(crate) established: bool,
    pub(crate) received: Vec<Vec<u8>>,
    pub(crate) sends: usize,
    pub(crate) reads: Vec<(Vec<u8>, RemoteDescriptor)>,
    pub(crate) writes: Vec<(usize, RemoteDescriptor)>,
    pub(crate) disconnected: Option<ConnectionStats>,
}

/// A handler that records every callback and never answers
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder {
    pub(crate) log: Arc<Mutex<Log>>,
}

impl ConnectionHandler for Recorder {
    fn on_established(&mut self, _ctx: &mut ConnectionCtx<'_>) -> Result<()> {
        self.log.lock().established = true;
        Ok(())
    }

    fn on_completion(&mut self, _ctx: &mut ConnectionCtx<'_>, completion: Completion<'_>) -> Result<()> {
        let mut log = self.log.lock();
        match completion {
            Completion::Receive { data } => log.received.push(data.to_vec()),
            Completion::Send { .. } => log.sends += 1,
            Completion::RemoteRead { data, remote } => log.reads.push((data.to_vec(), remote)),
            Completion::RemoteWrite { len, remote } => log.writes.push((len, remote)),
        }
        Ok(())
    }

    fn on_disconnected(&mut self, stats: &ConnectionStats) {
        self.log.lock().disconnected = Some(*stats);
    }
}

/// A fresh loopback address
pub(crate) fn get_unused_addr() -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), pick_unused_port().unwrap()).into()
}

/// A server worker and a client worker over one loopback provider
#[allow(unused)] // It's actually used in other tests
pub(crate) struct Pair {
    pub(crate) loopback: Arc<LoopbackProvider>,
    pub(crate) server: WorkerContext,
    pub(crate) client: WorkerContext,
    pub(crate) server_conn: ConnectionId,
    pub(crate) client_conn: ConnectionId,
    pub(crate) addr: SocketAddr,
}

#[allow(unused)] // It's actually used in other tests
impl Pair {
    /// Listen, connect and pump until both sides are established
    pub(crate) fn establish(
        server_config: EngineConfig,
        client_config: EngineConfig,
        factory: HandlerFactory,
        client_handler: Box<dyn ConnectionHandler>,
    ) -> Self {
        let loopback = Arc::new(LoopbackProvider::new());
        let provider: Arc<dyn TransportProvider> = Arc::<LoopbackProvider>::clone(&loopback);
        let mut server = WorkerContext::new(Arc::clone(&provider), server_config).unwrap();
        let mut client = WorkerContext::new(provider, client_config).unwrap();
        let addr = get_unused_addr();
        let _listener = server.listen(addr, factory).unwrap();
        let client_conn = client.connect(addr, client_handler).unwrap();
        let mut pair = Self {
            loopback,
            server,
            client,
            server_conn: client_conn,
            client_conn,
            addr,
        };
        pair.pump();
        pair.server_conn = pair.server.connection_ids().next().unwrap();
        pair
    }

    /// Listen with `ReplyingHandler`s behind a recording client
    pub(crate) fn replying(server_config: EngineConfig, client_config: EngineConfig) -> (Self, Arc<Mutex<Log>>) {
        let recorder = Recorder::default();
        let log = Arc::clone(&recorder.log);
        let pair = Self::establish(
            server_config,
            client_config,
            Box::new(|_| Box::new(rdma_kv_engine::ReplyingHandler::default()) as Box<dyn ConnectionHandler>),
            Box::new(recorder),
        );
        (pair, log)
    }

    /// Drive both workers until neither has anything left to do
    pub(crate) fn pump(&mut self) {
        for _ in 0..MAX_PUMP_ROUNDS {
            let work = self.server.process_cm_events().unwrap()
                + self.client.process_cm_events().unwrap()
                + self.server.poll_completions().unwrap()
                + self.client.poll_completions().unwrap();
            if work == 0 {
                return;
            }
        }
        panic!("workers still busy after {MAX_PUMP_ROUNDS} rounds");
    }
}
