//! Server lifecycle: bind the listener, accept connections, hand each off to the
//! protocol engine its first byte selects. Grounded on the source's
//! `Segcache::new(config)` / `.wait()` shape and its per-connection
//! `tokio::spawn` acceptor loop.

pub mod binary_conn;
pub mod config;
pub mod detector;
pub mod text_conn;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use config::Config;
use memc_common::SystemClock;
use memc_store::Store;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct Server {
    config: Config,
    store: Arc<Store>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let store = Arc::new(Store::new(
            Arc::new(SystemClock::new()),
            threads,
            config.stats.extra_stats,
        ));
        Server { config, store }
    }

    /// Exposes the store so embedders (and tests) can bind to an ephemeral port and
    /// still reach the same store the acceptor dispatches into.
    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Binds the configured listener and runs the accept loop until it errors.
    /// A failure to accept one connection is logged and never ends the loop, per
    /// the acceptor's contract.
    pub async fn run(self) -> std::io::Result<()> {
        let addr = self.config.listen();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening");
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        if self.config.general.autoreload {
            info!("autoreload enabled (no-op in this implementation)");
        }
        let slowdown = Duration::from_secs_f64(self.config.worker.slowdown.max(0.0));

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let store = self.store.clone();
            store.connection_opened();
            info!(%peer, "accepted connection");

            tokio::spawn(async move {
                let _guard = ConnectionGuard(store.clone());
                run_connection(stream, store, slowdown).await;
            });
        }
    }
}

/// Decrements `curr_connections` on every exit path out of a connection's task,
/// instead of repeating the decrement at each `return`.
struct ConnectionGuard(Arc<Store>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

async fn run_connection(mut stream: tokio::net::TcpStream, store: Arc<Store>, slowdown: Duration) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut scratch = [0u8; 4096];

    let n = match stream.read(&mut scratch).await {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    buf.extend_from_slice(&scratch[..n]);

    match detector::detect(buf[0]) {
        detector::Dialect::Binary => binary_conn::handle(stream, store, buf).await,
        detector::Dialect::Text => text_conn::handle(stream, store, buf, slowdown).await,
    }
}
