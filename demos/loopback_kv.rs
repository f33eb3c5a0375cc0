//! This demo runs a key-value style server and a client over the loopback provider,
//! each on its own worker thread. The client issues a plain request, a `noreply` request
//! and a one-sided read announced through a remote-access header.
//!
//! You can try this example by running:
//!
//!     cargo run --example loopback_kv

use parking_lot::Mutex;
use rdma_kv_engine::{
    spawn_worker, Completion, ConnectionCtx, ConnectionHandler, EngineConfig, HeaderEncoding, LoopbackProvider,
    RemoteAccessHeader, RemoteOp, ReplyingHandler, TransportProvider, WorkerContext,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::oneshot;

/// Number of replies the client waits for
const EXPECTED_REPLIES: usize = 2;

/// Prints what the server sends back
#[derive(Debug)]
struct PrintingClient {
    /// Replies received so far
    replies: Arc<Mutex<usize>>,
}

impl ConnectionHandler for PrintingClient {
    fn on_established(&mut self, ctx: &mut ConnectionCtx<'_>) -> rdma_kv_engine::Result<()> {
        println!("{} established", ctx.id());
        Ok(())
    }

    fn on_completion(
        &mut self,
        ctx: &mut ConnectionCtx<'_>,
        completion: Completion<'_>,
    ) -> rdma_kv_engine::Result<()> {
        if let Completion::Receive { data } = completion {
            println!("{} got {:?}", ctx.id(), String::from_utf8_lossy(data));
            *self.replies.lock() += 1;
        }
        Ok(())
    }
}

/// The server: answers until `stop` fires
fn server(
    provider: Arc<dyn TransportProvider>,
    addr: SocketAddr,
    listening: std::sync::mpsc::Sender<()>,
    stop: oneshot::Receiver<()>,
) -> std::io::Result<std::thread::JoinHandle<rdma_kv_engine::Result<()>>> {
    spawn_worker("kv-server", move || async move {
        let mut worker = WorkerContext::new(provider, EngineConfig::default())?;
        let _listener = worker.listen(
            addr,
            Box::new(|_| Box::new(ReplyingHandler::default()) as Box<dyn ConnectionHandler>),
        )?;
        let _sent = listening.send(());
        worker
            .run_until(async {
                let _ = stop.await;
            })
            .await?;
        println!("server done: {:?}", worker.dispatch_stats());
        Ok(())
    })
}

fn main() {
    tracing_subscriber::fmt::init();
    let provider: Arc<dyn TransportProvider> = Arc::new(LoopbackProvider::new());
    let addr: SocketAddr = "127.0.0.1:11211".parse().unwrap();
    let (listening_tx, listening_rx) = std::sync::mpsc::channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    let server = server(Arc::clone(&provider), addr, listening_tx, stop_rx).unwrap();
    listening_rx.recv().unwrap();

    let client = spawn_worker("kv-client", move || async move {
        let mut worker = WorkerContext::new(provider, EngineConfig::default())?;
        let replies = Arc::new(Mutex::new(0_usize));
        let conn = worker.connect(
            addr,
            Box::new(PrintingClient {
                replies: Arc::clone(&replies),
            }),
        )?;

        worker.send(conn, b"get foo\r\n")?;
        worker.send(conn, b"set foo 0 0 3 noreply\r\nbar\r\n")?;
        let value = worker.with_connection(conn, |ctx| ctx.expose_for_read(b"a value the server reads"))?;
        let header = RemoteAccessHeader::encode(RemoteOp::ReadFromMe, HeaderEncoding::Text, &value, b"get bar\r\n")?;
        worker.send(conn, &header)?;

        worker
            .run_until(async {
                while *replies.lock() < EXPECTED_REPLIES {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await?;
        println!("client stats: {:?}", worker.connection_stats(conn));
        worker.disconnect(conn)
    })
    .unwrap();

    client.join().unwrap().unwrap();
    stop_tx.send(()).unwrap();
    server.join().unwrap().unwrap();
}
