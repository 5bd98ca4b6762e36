//! One connection, start to finish.

use rustls::ServerConnection;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::backend::BackendDialer;
use super::gate::HandshakeGate;
use super::install::{ConnectionPair, Installer};
use super::ktls::TlsOffload;
use super::monitor::LifecycleMonitor;
use super::peek::PeekedStream;
use super::sni::{SniInspector, SniResult};
use crate::SpliceError;

/// Per-connection pipeline: optional SNI sniff, handshake, backend dial,
/// kernel handoff, then lifecycle monitoring until the client leaves.
pub struct Splicer<O> {
    sni: Option<SniInspector>,
    gate: HandshakeGate,
    dialer: BackendDialer,
    installer: Installer<O>,
    monitor: LifecycleMonitor,
}

impl<O> Splicer<O>
where
    O: TlsOffload<ServerConnection>,
{
    pub fn new(gate: HandshakeGate, dialer: BackendDialer, installer: Installer<O>) -> Self {
        Self {
            sni: None,
            gate,
            dialer,
            installer,
            monitor: LifecycleMonitor::new(),
        }
    }

    /// Log the requested server name before each handshake.
    pub fn with_sni_inspector(mut self, inspector: SniInspector) -> Self {
        self.sni = Some(inspector);
        self
    }

    pub fn with_monitor(mut self, monitor: LifecycleMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Serve `client` until it disconnects.
    ///
    /// Any error has already closed both sockets and removed the pair's
    /// redirect entries by the time it is returned.
    pub async fn handle(&self, client: TcpStream) -> Result<(), SpliceError> {
        let mut client = PeekedStream::new(client);

        if let Some(inspector) = &self.sni {
            match inspector.inspect(&mut client).await {
                Ok(SniResult::Found(hostname)) => debug!(hostname = %hostname, "SNI extracted"),
                Ok(result) => debug!(result = ?result, "No SNI extracted"),
                Err(e) => debug!(error = %e, "SNI inspection failed"),
            }
        }

        let (client, session, early_data) = self.gate.accept(client).await?.into_socket()?;

        // Dropping `client` on failure closes the connection.
        let mut backend = self.dialer.dial().await?;

        // Must reach the backend before anything the kernel redirects.
        forward_early_data(&mut backend, &early_data).await?;

        let pair = ConnectionPair::new(client, backend)?;
        let client_ports = pair.client_ports();
        let backend_ports = pair.backend_ports();

        let spliced = self.installer.install(pair, session)?;
        info!(
            client_ports = %client_ports,
            backend_ports = %backend_ports,
            ktls_tx = spliced.ktls().tx,
            ktls_rx = spliced.ktls().rx,
            "Data path handed to kernel"
        );

        self.monitor.run(spliced).await
    }
}

/// Write plaintext that rustls decrypted during the handshake to `backend`.
async fn forward_early_data(backend: &mut TcpStream, data: &[u8]) -> Result<(), SpliceError> {
    if data.is_empty() {
        return Ok(());
    }

    let write = async {
        backend.write_all(data).await?;
        backend.flush().await
    };
    write.await.map_err(|source| SpliceError::EarlyData {
        len: data.len(),
        source,
    })?;

    debug!(bytes = data.len(), "Forwarded early application data");
    Ok(())
}
