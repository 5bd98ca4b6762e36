//! Test harness for terminator integration tests.
//!
//! Provides a capturing plaintext backend, a terminator wired to an
//! in-memory redirect map, and a TLS client. Kernel TLS is replaced by a
//! recording stand-in, and the splice itself by `SpliceEmulator`.

use std::io;
use std::net::SocketAddr;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use tlsplice_terminator::proxy::{
    BackendDialer, HandshakeGate, Installer, KtlsState, Listener, ListenerConfig, OffloadError,
    SniInspector, Splicer, TlsOffload,
};
use tlsplice_terminator::tls;
use tlsplice_testing::MemoryRedirectMap;

pub const SERVER_NAME: &str = "example.test";

/// Plaintext backend that records everything it is sent.
#[allow(dead_code)]
pub struct CaptureBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub closed: Arc<AtomicU64>,
    pub peers: Arc<Mutex<Vec<SocketAddr>>>,
    pub received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl CaptureBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicU64::new(0));
        let peers = Arc::new(Mutex::new(Vec::new()));
        let received = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let closed_clone = Arc::clone(&closed);
        let peers_clone = Arc::clone(&peers);
        let received_clone = Arc::clone(&received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, peer)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                peers_clone.lock().unwrap().push(peer);
                                let closed = Arc::clone(&closed_clone);
                                let received = Arc::clone(&received_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => received.lock().unwrap().extend_from_slice(&buf[..n]),
                                        }
                                    }
                                    closed.fetch_add(1, Ordering::Relaxed);
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            closed,
            peers,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn closed_count(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until `n` backend connections have been accepted; return their peers.
    pub async fn wait_for_peers(&self, n: usize) -> Vec<SocketAddr> {
        wait_until(|| self.peers.lock().unwrap().len() >= n).await;
        self.peers.lock().unwrap().clone()
    }
}

impl Drop for CaptureBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Offload stand-in: counts calls and either succeeds or fails.
#[derive(Clone, Default)]
pub struct TestOffload {
    pub calls: Arc<AtomicU64>,
    fail: bool,
}

#[allow(dead_code)]
impl TestOffload {
    pub fn failing() -> Self {
        Self {
            calls: Arc::new(AtomicU64::new(0)),
            fail: true,
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl<S: Send> TlsOffload<S> for TestOffload {
    fn enable(&self, _socket: BorrowedFd<'_>, _session: S) -> Result<KtlsState, OffloadError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail {
            return Err(OffloadError::NoCipherSuite);
        }
        Ok(KtlsState { tx: true, rx: true })
    }
}

/// A running terminator bound to an ephemeral port.
#[allow(dead_code)]
pub struct TerminatorHandle {
    pub addr: SocketAddr,
    pub map: Arc<MemoryRedirectMap>,
    pub offload: TestOffload,
    pub cert_der: CertificateDer<'static>,
    task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
pub struct TerminatorOptions {
    pub offload: TestOffload,
    pub map: Option<Arc<MemoryRedirectMap>>,
    pub sniff_sni: bool,
    pub connect_timeout: Option<Duration>,
}

impl TerminatorHandle {
    pub async fn spawn(backend_addr: SocketAddr) -> io::Result<Self> {
        Self::spawn_with(backend_addr, TerminatorOptions::default()).await
    }

    pub async fn spawn_with(
        backend_addr: SocketAddr,
        options: TerminatorOptions,
    ) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
            .map_err(io::Error::other)?;
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
        let tls_config =
            tls::server_config(vec![cert_der.clone()], key_der).map_err(io::Error::other)?;

        let map = options
            .map
            .unwrap_or_else(|| Arc::new(MemoryRedirectMap::new()));
        let dialer = match options.connect_timeout {
            Some(t) => BackendDialer::with_timeout(backend_addr, t),
            None => BackendDialer::new(backend_addr),
        };

        let installer = Installer::new(map.clone(), options.offload.clone());
        let mut splicer = Splicer::new(HandshakeGate::new(tls_config), dialer, installer);
        if options.sniff_sni {
            splicer = splicer.with_sni_inspector(SniInspector::new());
        }

        let listener = Listener::bind(
            ListenerConfig::new("127.0.0.1:0".parse().unwrap()),
            Arc::new(splicer),
        )
        .await?;
        let addr = listener.local_addr()?;

        let task = tokio::spawn(async move {
            let _ = Arc::new(listener).run().await;
        });

        Ok(Self {
            addr,
            map,
            offload: options.offload,
            cert_der,
            task,
        })
    }
}

impl Drop for TerminatorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Connect to `addr` and complete a TLS handshake for [`SERVER_NAME`].
pub async fn tls_client_connect(
    addr: SocketAddr,
    cert_der: &CertificateDer<'static>,
) -> io::Result<TlsStream<TcpStream>> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der.clone()).map_err(io::Error::other)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(io::Error::other)?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let stream = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(SERVER_NAME).map_err(io::Error::other)?;
    TlsConnector::from(Arc::new(config))
        .connect(name, stream)
        .await
}

/// Poll `cond` every 5ms for up to 2s.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 2s");
}

/// TLS record content type of an alert.
const CONTENT_TYPE_ALERT: u8 = 0x15;

/// Assert the peer closed `stream` (EOF or reset) within 2s.
///
/// A TLS alert sent just before the close is allowed; any other data is not.
#[allow(dead_code)]
pub async fn assert_closed(stream: &mut TcpStream) {
    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await
    .expect("connection still open after 2s");

    assert!(
        received.is_empty() || received[0] == CONTENT_TYPE_ALERT,
        "unexpected data before close: {received:?}"
    );
}
