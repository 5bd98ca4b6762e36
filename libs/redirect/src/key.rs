//! Redirect key derivation.
//!
//! The verdict program looks up the peer socket with a 64-bit key built from
//! the receiving socket's ports:
//!
//! ```text
//!  63            32 31                          0
//! +----------------+-----------------------------+
//! |  local port    |  bswap32(remote port as u32) |
//! +----------------+-----------------------------+
//! ```
//!
//! The low half is the remote port written big-endian and read back
//! little-endian. The deployed verdict program was built against exactly this
//! packing, so it must not be "fixed" here without changing the program too.

use std::fmt;
use std::net::SocketAddr;

/// Local/remote port pair of one TCP connection, as seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    /// Port of our end of the connection.
    pub local: u16,
    /// Port of the peer's end of the connection.
    pub remote: u16,
}

impl PortPair {
    /// Create a port pair.
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }

    /// Build the pair from a socket's local and peer addresses.
    pub fn from_addrs(local: SocketAddr, remote: SocketAddr) -> Self {
        Self::new(local.port(), remote.port())
    }

    /// Redirect key for traffic arriving on this connection.
    pub fn key(&self) -> RedirectKey {
        RedirectKey::derive(self.local, self.remote)
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.local, self.remote)
    }
}

/// Key into the shared redirect map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RedirectKey(u64);

impl RedirectKey {
    /// Derive the key for a connection with the given local and remote ports.
    pub fn derive(local_port: u16, remote_port: u16) -> Self {
        let remote = u32::from_le_bytes(u32::from(remote_port).to_be_bytes());
        Self((u64::from(local_port) << 32) | u64::from(remote))
    }

    /// Wrap a raw key value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value stored in the map.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Local port encoded in the high half.
    pub fn local_port(&self) -> u16 {
        (self.0 >> 32) as u16
    }

    /// Remote port recovered from the byte-swapped low half.
    pub fn remote_port(&self) -> u16 {
        u32::from_be_bytes((self.0 as u32).to_le_bytes()) as u16
    }
}

impl fmt::Display for RedirectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<RedirectKey> for u64 {
    fn from(key: RedirectKey) -> Self {
        key.0
    }
}
