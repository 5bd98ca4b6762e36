//! Pair lifecycle after the kernel takes over.
//!
//! Only the client socket is watched, and only for peer read-hangup. The
//! backend side is not watched: if the backend closes first, the pair stays
//! installed until the client goes away.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::install::SplicedPair;
use crate::SpliceError;

/// Default number of attempts to register the peer-close watch.
pub const DEFAULT_REGISTRATION_ATTEMPTS: u32 = 5;

struct EpollFd(Epoll);

impl AsRawFd for EpollFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0 .0.as_raw_fd()
    }
}

/// A private epoll instance watching one socket for peer close.
pub struct PeerCloseWatch {
    epoll: AsyncFd<EpollFd>,
}

impl PeerCloseWatch {
    /// Register `socket` for read-hangup, retrying up to `attempts` times.
    pub fn register(socket: BorrowedFd<'_>, attempts: u32) -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let event = EpollEvent::new(EpollFlags::EPOLLRDHUP, socket.as_raw_fd() as u64);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match epoll.add(socket, event) {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    debug!(attempt, error = %e, "Peer-close registration failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        // SAFETY: `EpollFd` owns the epoll descriptor, so it stays open and
        // refers to the same instance until the `AsyncFd` is dropped.
        let epoll =
            unsafe { AsyncFd::register_with_interest(EpollFd(epoll), Interest::READABLE)? };
        Ok(Self { epoll })
    }

    /// Wait until the peer has closed its write half (or the socket hung up).
    pub async fn closed(&self) -> io::Result<()> {
        let mut events = [EpollEvent::empty(); 1];
        loop {
            let mut guard = self.epoll.readable().await?;
            match guard.get_inner().0.wait(&mut events, EpollTimeout::ZERO) {
                Ok(0) => guard.clear_ready(),
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Waits for each spliced pair to end and tears it down.
#[derive(Debug, Clone)]
pub struct LifecycleMonitor {
    registration_attempts: u32,
}

impl Default for LifecycleMonitor {
    fn default() -> Self {
        Self {
            registration_attempts: DEFAULT_REGISTRATION_ATTEMPTS,
        }
    }
}

impl LifecycleMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registration_attempts(attempts: u32) -> Self {
        Self {
            registration_attempts: attempts.max(1),
        }
    }

    /// Block until the client hangs up, then tear the pair down.
    ///
    /// The pair is torn down on every exit path, including registration
    /// failure.
    pub async fn run(&self, mut pair: SplicedPair) -> Result<(), SpliceError> {
        let result = match pair.client() {
            Some(client) => self.watch(client).await,
            None => Ok(()),
        };

        pair.teardown();
        match result {
            Ok(()) => {
                info!(
                    client_key = %pair.client_key(),
                    backend_key = %pair.backend_key(),
                    "Client closed, pair released"
                );
                Ok(())
            }
            Err(e) => Err(SpliceError::Watch(e)),
        }
    }

    async fn watch(&self, client: &TcpStream) -> io::Result<()> {
        let watch = PeerCloseWatch::register(client.as_fd(), self.registration_attempts)?;

        let drain = drain(client);
        tokio::pin!(drain);
        let mut draining = true;

        loop {
            tokio::select! {
                res = watch.closed() => return res,
                _ = &mut drain, if draining => draining = false,
            }
        }
    }
}

/// Read and discard whatever user space still sees on the client socket.
///
/// Best effort: ends quietly on EOF or error and never decides the pair's
/// fate.
async fn drain(client: &TcpStream) {
    let mut buf = [0u8; 1024];
    loop {
        if client.readable().await.is_err() {
            return;
        }
        match client.try_read(&mut buf) {
            Ok(0) => return,
            Ok(n) => debug!(bytes = n, "Drained bytes from client socket"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tlsplice_testing::MemoryRedirectMap;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use crate::proxy::{ConnectionPair, Installer, KtlsState, OffloadError, TlsOffload};

    struct NoOffload;

    impl TlsOffload<()> for NoOffload {
        fn enable(&self, _socket: BorrowedFd<'_>, _session: ()) -> Result<KtlsState, OffloadError> {
            Ok(KtlsState::default())
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let far = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (near, _) = listener.accept().await.unwrap();
        (near, far)
    }

    #[tokio::test]
    async fn test_watch_fires_on_peer_close() {
        let (near, far) = tcp_pair().await;
        let watch = PeerCloseWatch::register(near.as_fd(), 1).unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), watch.closed()).await;
        assert!(pending.is_err(), "watch fired before the peer closed");

        drop(far);
        tokio::time::timeout(Duration::from_secs(2), watch.closed())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_fires_on_half_close() {
        let (near, mut far) = tcp_pair().await;
        let watch = PeerCloseWatch::register(near.as_fd(), 1).unwrap();

        far.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), watch.closed())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_tears_down_on_client_close() {
        let (client, mut client_far) = tcp_pair().await;
        let (backend, _backend_far) = tcp_pair().await;

        let map = Arc::new(MemoryRedirectMap::new());
        let installer = Installer::new(map.clone(), NoOffload);
        let spliced = installer
            .install(ConnectionPair::new(client, backend).unwrap(), ())
            .unwrap();
        assert_eq!(map.len(), 2);

        let task = tokio::spawn(async move { LifecycleMonitor::new().run(spliced).await });

        // Data the kernel did not redirect is drained, not a close signal.
        client_far.write_all(b"stray").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(map.len(), 2);

        drop(client_far);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_registration_on_bad_fd_fails() {
        // An epoll instance cannot watch a regular file.
        let file = tempfile::tempfile().unwrap();
        assert!(PeerCloseWatch::register(file.as_fd(), 2).is_err());
    }
}
