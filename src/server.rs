//! TCP front end
//!
//! Accepts connections and runs one [`TransferSession`] per connection on
//! its own task, so a session blocked on a result never stalls the others.

use anyhow::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;

use crate::metrics;
use crate::session::{SessionContext, TransferSession};

pub struct Server {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    next_session: AtomicU64,
}

impl Server {
    pub async fn bind(addr: &str, ctx: Arc<SessionContext>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        tracing::info!("Ingestion server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            ctx,
            next_session: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run_until<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => {
                        // e.g. fd exhaustion; keep serving
                        tracing::error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                _ = &mut shutdown => {
                    tracing::info!("Ingestion server shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::with_capacity(self.ctx.config.chunk_size.max(8 * 1024), read_half);
        let session = TransferSession::new(id, peer.to_string(), reader, write_half, Arc::clone(&self.ctx));

        metrics::CONNECTIONS_TOTAL.inc();
        metrics::CONNECTIONS_ACTIVE.inc();
        tracing::info!(session = id, "Accepted connection from {}", peer);

        let span = tracing::info_span!("session", id, %peer);
        tokio::spawn(
            async move {
                session.run().await;
                metrics::CONNECTIONS_ACTIVE.dec();
            }
            .instrument(span),
        );
    }
}
