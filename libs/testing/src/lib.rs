//! Test doubles for code that drives the kernel redirect map.
//!
//! - [`MemoryRedirectMap`]: in-memory stand-in for the sock-hash map, with
//!   injectable per-key insert failures
//! - [`SpliceEmulator`]: emulates the verdict program by routing bytes
//!   "arriving" on one socket to the socket the map pairs it with

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tlsplice_redirect::{MapError, PortPair, RedirectKey, RedirectMap};

/// In-memory redirect map. Values are the raw descriptor numbers, exactly as
/// the kernel map would report them.
#[derive(Debug, Default)]
pub struct MemoryRedirectMap {
    entries: Mutex<HashMap<RedirectKey, RawFd>>,
    rejected: Mutex<HashSet<RedirectKey>>,
}

impl MemoryRedirectMap {
    /// Create an empty map that accepts every insert.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty map that refuses inserts for `key`.
    pub fn rejecting(key: RedirectKey) -> Self {
        let map = Self::new();
        map.reject(key);
        map
    }

    /// Refuse future inserts for `key`.
    pub fn reject(&self, key: RedirectKey) {
        self.rejected.lock().unwrap().insert(key);
    }

    /// Descriptor stored under `key`, if any.
    pub fn get(&self, key: RedirectKey) -> Option<RawFd> {
        self.entries.lock().unwrap().get(&key).copied()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries, sorted by key.
    pub fn entries(&self) -> Vec<(RedirectKey, RawFd)> {
        let mut entries: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        entries.sort();
        entries
    }

    /// Poll until the map holds exactly `len` entries. Returns false on timeout.
    pub async fn wait_for_len(&self, len: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.len() != len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }
}

impl RedirectMap for MemoryRedirectMap {
    fn insert(&self, key: RedirectKey, socket: BorrowedFd<'_>) -> Result<(), MapError> {
        if self.rejected.lock().unwrap().contains(&key) {
            return Err(MapError::Insert {
                key,
                source: io::Error::other("insert rejected by test map"),
            });
        }
        self.entries
            .lock()
            .unwrap()
            .insert(key, socket.as_raw_fd());
        Ok(())
    }

    fn remove(&self, key: RedirectKey) -> Result<(), MapError> {
        self.entries.lock().unwrap().remove(&key);
        Ok(())
    }
}

/// Redirect key the verdict program would compute for traffic arriving on
/// `socket`.
pub fn socket_key(socket: BorrowedFd<'_>) -> io::Result<RedirectKey> {
    let stream = TcpStream::from(socket.try_clone_to_owned()?);
    let ports = PortPair::from_addrs(stream.local_addr()?, stream.peer_addr()?);
    Ok(ports.key())
}

/// User-space emulation of the kernel splice: whatever is delivered on socket
/// X is written to the socket the map pairs X's key with.
#[derive(Debug, Clone)]
pub struct SpliceEmulator {
    map: Arc<MemoryRedirectMap>,
}

impl SpliceEmulator {
    pub fn new(map: Arc<MemoryRedirectMap>) -> Self {
        Self { map }
    }

    /// Descriptor that traffic arriving on `socket` is redirected to.
    pub fn route(&self, socket: impl AsFd) -> io::Result<Option<RawFd>> {
        let key = socket_key(socket.as_fd())?;
        Ok(self.map.get(key))
    }

    /// Deliver `data` as if it had arrived on `socket`.
    pub fn deliver(&self, socket: impl AsFd, data: &[u8]) -> io::Result<()> {
        self.deliver_to_key(socket_key(socket.as_fd())?, data)
    }

    /// Deliver `data` as if it had arrived on the connection whose tuple
    /// derives `key`. Useful when the receiving socket is owned elsewhere.
    pub fn deliver_to_key(&self, key: RedirectKey, data: &[u8]) -> io::Result<()> {
        let target = self.map.get(key).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no redirect entry for {key}"),
            )
        })?;

        // SAFETY: the map only holds descriptors of sockets the pair under
        // test still owns; the emulator is used while the pair is active.
        let target = unsafe { BorrowedFd::borrow_raw(target) };
        let mut out = TcpStream::from(target.try_clone_to_owned()?);

        let mut written = 0;
        while written < data.len() {
            match out.write(&data[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
