//! TCP listener and connection dispatch.
//!
//! Every accepted connection gets its own task running the [`Splicer`]
//! pipeline. A failing connection is logged and dropped; the accept loop
//! keeps going.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConnection;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::ktls::TlsOffload;
use super::splicer::Splicer;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// The terminator's front door.
pub struct Listener<O> {
    listener: TcpListener,
    splicer: Arc<Splicer<O>>,
    conn_semaphore: Arc<Semaphore>,
}

impl<O> Listener<O>
where
    O: TlsOffload<ServerConnection> + 'static,
{
    /// Bind the listening socket.
    pub async fn bind(config: ListenerConfig, splicer: Arc<Splicer<O>>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            listener,
            splicer,
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    let splicer = Arc::clone(&self.splicer);

                    tokio::spawn(
                        async move {
                            match splicer.handle(stream).await {
                                Ok(()) => debug!("Connection finished"),
                                Err(e) if e.is_client_fault() => {
                                    debug!(error = %e, reason = e.reason_code(), "Connection aborted");
                                }
                                Err(e) => {
                                    warn!(error = %e, reason = e.reason_code(), "Connection aborted");
                                }
                            }

                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
