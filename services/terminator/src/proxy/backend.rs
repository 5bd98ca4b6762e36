//! Backend dialing.
//!
//! One fresh connection per client; there is no pooling or health tracking.
//! - Connect timeout to backend: 2s default

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::SpliceError;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Dials the configured backend.
#[derive(Debug, Clone)]
pub struct BackendDialer {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl BackendDialer {
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_timeout(addr, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            addr,
            connect_timeout,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open a new connection to the backend.
    pub async fn dial(&self) -> Result<TcpStream, SpliceError> {
        match timeout(self.connect_timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(stream)) => {
                debug!(backend_addr = %self.addr, "Connected to backend");
                Ok(stream)
            }
            Ok(Err(source)) => Err(SpliceError::Dial {
                addr: self.addr,
                source,
            }),
            Err(_) => Err(SpliceError::DialTimeout(self.addr)),
        }
    }
}
