//! Handing a connection pair to the kernel.
//!
//! Installation order matters: both redirect entries go in before kernel TLS
//! is enabled, so the first decrypted record on the client socket already
//! has somewhere to go. Any failure undoes what was done so far.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;

use nix::sys::socket::{setsockopt, sockopt};
use tlsplice_redirect::{PortPair, RedirectKey, RedirectMap};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::ktls::{KtlsState, TlsOffload};
use crate::SpliceError;

/// Default send/receive buffer size for spliced client sockets.
pub const DEFAULT_SOCKET_BUFFER_BYTES: usize = 6_553_500;

/// Client and backend sockets before installation.
#[derive(Debug)]
pub struct ConnectionPair {
    client: TcpStream,
    backend: TcpStream,
    client_ports: PortPair,
    backend_ports: PortPair,
}

impl ConnectionPair {
    pub fn new(client: TcpStream, backend: TcpStream) -> io::Result<Self> {
        let client_ports = PortPair::from_addrs(client.local_addr()?, client.peer_addr()?);
        let backend_ports = PortPair::from_addrs(backend.local_addr()?, backend.peer_addr()?);
        Ok(Self {
            client,
            backend,
            client_ports,
            backend_ports,
        })
    }

    pub fn client_ports(&self) -> PortPair {
        self.client_ports
    }

    pub fn backend_ports(&self) -> PortPair {
        self.backend_ports
    }

    /// Key for traffic arriving on the client socket.
    pub fn client_key(&self) -> RedirectKey {
        self.client_ports.key()
    }

    /// Key for traffic arriving on the backend socket.
    pub fn backend_key(&self) -> RedirectKey {
        self.backend_ports.key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Active,
    Closed,
}

/// A pair whose data path belongs to the kernel.
///
/// Owns both sockets and both redirect entries. [`SplicedPair::teardown`]
/// (or dropping the pair) removes the entries and then closes the sockets.
pub struct SplicedPair {
    map: Arc<dyn RedirectMap>,
    client_key: RedirectKey,
    backend_key: RedirectKey,
    client: Option<TcpStream>,
    backend: Option<TcpStream>,
    ktls: KtlsState,
}

impl SplicedPair {
    pub fn state(&self) -> PairState {
        if self.client.is_some() || self.backend.is_some() {
            PairState::Active
        } else {
            PairState::Closed
        }
    }

    pub fn client(&self) -> Option<&TcpStream> {
        self.client.as_ref()
    }

    pub fn backend(&self) -> Option<&TcpStream> {
        self.backend.as_ref()
    }

    pub fn client_key(&self) -> RedirectKey {
        self.client_key
    }

    pub fn backend_key(&self) -> RedirectKey {
        self.backend_key
    }

    pub fn ktls(&self) -> KtlsState {
        self.ktls
    }

    /// Remove both redirect entries, then close both sockets.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn teardown(&mut self) {
        if self.state() == PairState::Closed {
            return;
        }

        for key in [self.backend_key, self.client_key] {
            if let Err(e) = self.map.remove(key) {
                warn!(key = %key, error = %e, "Failed to remove redirect entry");
            }
        }

        self.client.take();
        self.backend.take();
        debug!(
            client_key = %self.client_key,
            backend_key = %self.backend_key,
            "Pair torn down"
        );
    }

    fn client_fd(&self) -> Option<BorrowedFd<'_>> {
        self.client.as_ref().map(AsFd::as_fd)
    }
}

impl Drop for SplicedPair {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for SplicedPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplicedPair")
            .field("client_key", &self.client_key)
            .field("backend_key", &self.backend_key)
            .field("state", &self.state())
            .field("ktls", &self.ktls)
            .finish()
    }
}

/// Installs redirect entries and kernel TLS for new pairs.
pub struct Installer<O> {
    map: Arc<dyn RedirectMap>,
    offload: O,
    socket_buffer_bytes: usize,
}

impl<O> Installer<O> {
    pub fn new(map: Arc<dyn RedirectMap>, offload: O) -> Self {
        Self {
            map,
            offload,
            socket_buffer_bytes: DEFAULT_SOCKET_BUFFER_BYTES,
        }
    }

    pub fn with_socket_buffer_bytes(mut self, bytes: usize) -> Self {
        self.socket_buffer_bytes = bytes;
        self
    }

    /// Hand `pair` to the kernel using the handshaken `session`.
    ///
    /// Sequence: backend-key entry, client-key entry, kernel TLS, buffer
    /// tuning. On error both sockets are closed and no entry for the pair is
    /// left in the map.
    pub fn install<S>(&self, pair: ConnectionPair, session: S) -> Result<SplicedPair, SpliceError>
    where
        O: TlsOffload<S>,
    {
        let client_key = pair.client_key();
        let backend_key = pair.backend_key();
        if client_key == backend_key {
            return Err(SpliceError::KeyCollision(client_key));
        }

        let ConnectionPair {
            client, backend, ..
        } = pair;

        // Replies from the backend go to the client...
        self.map.insert(backend_key, client.as_fd())?;
        // ...and client requests go to the backend.
        if let Err(e) = self.map.insert(client_key, backend.as_fd()) {
            if let Err(rollback) = self.map.remove(backend_key) {
                warn!(key = %backend_key, error = %rollback, "Rollback of redirect entry failed");
            }
            return Err(e.into());
        }

        debug!(
            client_key = %client_key,
            backend_key = %backend_key,
            "Redirect entries installed"
        );

        // From here on, dropping `spliced` undoes the entries.
        let mut spliced = SplicedPair {
            map: Arc::clone(&self.map),
            client_key,
            backend_key,
            client: Some(client),
            backend: Some(backend),
            ktls: KtlsState::default(),
        };

        let client_fd = spliced
            .client_fd()
            .ok_or_else(|| SpliceError::Io(io::ErrorKind::NotConnected.into()))?;
        spliced.ktls = self.offload.enable(client_fd, session)?;

        if let Some(client) = spliced.client() {
            if let Err(e) = tune_buffers(client, self.socket_buffer_bytes) {
                warn!(
                    error = %e,
                    bytes = self.socket_buffer_bytes,
                    "Socket buffer tuning failed"
                );
            }
        }

        Ok(spliced)
    }
}

fn tune_buffers(socket: &TcpStream, bytes: usize) -> nix::Result<()> {
    setsockopt(socket, sockopt::SndBuf, &bytes)?;
    setsockopt(socket, sockopt::RcvBuf, &bytes)
}
