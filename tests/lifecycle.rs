mod test_utilities;

use rdma_kv_engine::{
    ConnectionState, EngineConfig, EngineConfigBuilder, ErrorKind, LoopbackProvider, ReplyingHandler,
    SharedRegistry, TransportProvider, WorkerContext,
};
use std::{sync::Arc, time::Duration};
use test_utilities::{get_unused_addr, Pair, Recorder};

fn endpoint_of(worker: &mut WorkerContext, id: rdma_kv_engine::ConnectionId) -> u32 {
    worker.with_connection(id, |ctx| Ok(ctx.endpoint().0)).unwrap()
}

#[test]
fn registry_tracks_connects_and_disconnects() {
    let provider: Arc<dyn TransportProvider> = Arc::new(LoopbackProvider::new());
    let mut server = WorkerContext::new(Arc::clone(&provider), EngineConfig::default()).unwrap();
    let mut client = WorkerContext::new(provider, EngineConfig::default()).unwrap();
    let addr = get_unused_addr();
    let _listener = server
        .listen(
            addr,
            Box::new(|_| Box::new(ReplyingHandler::default()) as Box<dyn rdma_kv_engine::ConnectionHandler>),
        )
        .unwrap();

    let clients: Vec<_> = (0..5)
        .map(|_| client.connect(addr, Box::new(Recorder::default())).unwrap())
        .collect();
    for _ in 0..4 {
        let _ = server.process_cm_events().unwrap();
        let _ = client.process_cm_events().unwrap();
    }
    assert_eq!(server.connection_count(), 5);
    assert_eq!(server.registry().len(), 5);
    let accepted: Vec<_> = server.connection_ids().collect();
    let endpoints: Vec<_> = accepted
        .iter()
        .map(|&id| (id, endpoint_of(&mut server, id)))
        .collect();
    for &(id, endpoint) in &endpoints {
        assert_eq!(server.registry().lookup(endpoint), Some(id));
    }
    let client_endpoints: Vec<_> = clients.iter().map(|&id| endpoint_of(&mut client, id)).collect();

    client.disconnect(clients[1]).unwrap();
    client.disconnect(clients[3]).unwrap();
    for _ in 0..4 {
        let _ = server.process_cm_events().unwrap();
        let _ = client.process_cm_events().unwrap();
        let _ = server.poll_completions().unwrap();
        let _ = client.poll_completions().unwrap();
    }

    assert_eq!(client.state(clients[1]), None);
    assert_eq!(client.state(clients[3]), None);
    assert_eq!(client.registry().lookup(client_endpoints[1]), None);
    assert_eq!(client.registry().lookup(client_endpoints[3]), None);
    assert_eq!(client.registry().lookup(client_endpoints[0]), Some(clients[0]));
    assert_eq!(server.connection_count(), 3);
    assert_eq!(server.registry().len(), 3);
    for &(id, endpoint) in &endpoints {
        match server.state(id) {
            Some(state) => {
                assert_eq!(state, ConnectionState::Established);
                assert_eq!(server.registry().lookup(endpoint), Some(id));
            }
            None => assert_eq!(server.registry().lookup(endpoint), None),
        }
    }
}

#[test]
fn disconnect_releases_every_buffer() {
    let config = EngineConfigBuilder::default().pool_size(8_usize).build().unwrap();
    let recorder = Recorder::default();
    let log = Arc::clone(&recorder.log);
    let mut pair = Pair::establish(
        config,
        config,
        Box::new(|_| Box::new(ReplyingHandler::default()) as Box<dyn rdma_kv_engine::ConnectionHandler>),
        Box::new(recorder),
    );
    assert!(log.lock().established);
    let _exposed = pair
        .client
        .with_connection(pair.client_conn, |ctx| ctx.expose_for_read(b"value"))
        .unwrap();
    pair.client.send(pair.client_conn, b"get foo\r\n").unwrap();
    pair.pump();
    // two pools, two send buffers, the exposed region
    assert_eq!(pair.loopback.registered_regions(), 8 + 8 + 2 + 1);

    pair.server.disconnect(pair.server_conn).unwrap();
    pair.pump();

    assert_eq!(pair.server.state(pair.server_conn), None);
    assert_eq!(pair.client.state(pair.client_conn), None);
    assert_eq!(pair.loopback.registered_regions(), 0);
    // only the listener is left
    assert_eq!(pair.loopback.endpoint_count(), 1);
    assert_eq!(pair.server.outstanding_work(), 0);
    assert_eq!(pair.client.outstanding_work(), 0);
    let stats = log.lock().disconnected.unwrap();
    assert_eq!(stats.total_recv, 1);
    assert_eq!(stats.total_sent, 1);
}

#[test]
fn sends_after_disconnect_are_refused() {
    let (mut pair, _log) = Pair::replying(EngineConfig::default(), EngineConfig::default());
    let conn = pair.client_conn;
    pair.client.disconnect(conn).unwrap();
    let err = pair.client.send(conn, b"get foo\r\n").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    pair.pump();
    let err = pair.client.send(conn, b"get foo\r\n").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn unreachable_address_fails_resolution() {
    let provider: Arc<dyn TransportProvider> = Arc::new(LoopbackProvider::new());
    let mut client = WorkerContext::new(provider, EngineConfig::default()).unwrap();
    let err = client
        .connect(get_unused_addr(), Box::new(Recorder::default()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert_eq!(client.connection_count(), 0);
    assert!(client.registry().is_empty());
}

#[test]
fn zero_resolve_timeout_fails_resolution() {
    let provider: Arc<dyn TransportProvider> = Arc::new(LoopbackProvider::new());
    let mut server = WorkerContext::new(Arc::clone(&provider), EngineConfig::default()).unwrap();
    let addr = get_unused_addr();
    let _listener = server
        .listen(addr, Box::new(|_| Box::new(Recorder::default()) as Box<dyn rdma_kv_engine::ConnectionHandler>))
        .unwrap();
    let config = EngineConfigBuilder::default()
        .resolve_timeout(Duration::ZERO)
        .build()
        .unwrap();
    let mut client = WorkerContext::new(provider, config).unwrap();
    let err = client.connect(addr, Box::new(Recorder::default())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
}

#[test]
fn second_listen_is_refused() {
    let provider: Arc<dyn TransportProvider> = Arc::new(LoopbackProvider::new());
    let mut server = WorkerContext::new(provider, EngineConfig::default()).unwrap();
    let _listener = server
        .listen(
            get_unused_addr(),
            Box::new(|_| Box::new(Recorder::default()) as Box<dyn rdma_kv_engine::ConnectionHandler>),
        )
        .unwrap();
    let err = server
        .listen(
            get_unused_addr(),
            Box::new(|_| Box::new(Recorder::default()) as Box<dyn rdma_kv_engine::ConnectionHandler>),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn workers_can_share_one_registry() {
    let provider: Arc<dyn TransportProvider> = Arc::new(LoopbackProvider::new());
    let registry = SharedRegistry::with_expected(64).unwrap();
    let mut server =
        WorkerContext::with_registry(Arc::clone(&provider), EngineConfig::default(), registry.clone()).unwrap();
    let mut client = WorkerContext::with_registry(provider, EngineConfig::default(), registry.clone()).unwrap();
    let addr = get_unused_addr();
    let _listener = server
        .listen(
            addr,
            Box::new(|_| Box::new(ReplyingHandler::default()) as Box<dyn rdma_kv_engine::ConnectionHandler>),
        )
        .unwrap();
    let conn = client.connect(addr, Box::new(Recorder::default())).unwrap();
    for _ in 0..3 {
        let _ = server.process_cm_events().unwrap();
        let _ = client.process_cm_events().unwrap();
    }
    assert_eq!(registry.len(), 2);
    assert_eq!(client.state(conn), Some(ConnectionState::Established));
    assert_eq!(server.connection_count(), 1);
}

/// Fails on every message it receives
#[derive(Debug)]
struct Failing;

impl rdma_kv_engine::ConnectionHandler for Failing {
    fn on_completion(
        &mut self,
        _ctx: &mut rdma_kv_engine::ConnectionCtx<'_>,
        completion: rdma_kv_engine::Completion<'_>,
    ) -> rdma_kv_engine::Result<()> {
        match completion {
            rdma_kv_engine::Completion::Receive { .. } => {
                Err(rdma_kv_engine::Error::Resource("out of slots".to_owned()))
            }
            _ => Ok(()),
        }
    }
}

#[test]
fn handler_failure_disconnects() {
    let recorder = Recorder::default();
    let log = Arc::clone(&recorder.log);
    let mut pair = Pair::establish(
        EngineConfig::default(),
        EngineConfig::default(),
        Box::new(|_| Box::new(Failing) as Box<dyn rdma_kv_engine::ConnectionHandler>),
        Box::new(recorder),
    );
    pair.client.send(pair.client_conn, b"get foo\r\n").unwrap();
    pair.pump();
    assert_eq!(pair.server.connection_count(), 0);
    assert_eq!(pair.client.connection_count(), 0);
    assert!(log.lock().disconnected.is_some());
}
