//! Per-connection error type.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tlsplice_redirect::{MapError, RedirectKey};

use crate::proxy::OffloadError;

/// Errors that abort a single connection pair.
///
/// None of these reach the listener loop or another pair; every path that
/// returns one has already released what the pair acquired.
#[derive(Debug, Error)]
pub enum SpliceError {
    /// Client handshake failed (protocol error or client abort).
    #[error("handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// Client did not finish the handshake in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The handshake finished without reading every replayed byte.
    #[error("handshake left {0} peeked bytes unconsumed")]
    UnconsumedPeek(usize),

    /// Backend refused or reset the connection.
    #[error("dial to backend {addr} failed: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Backend did not accept in time.
    #[error("dial to backend {0} timed out")]
    DialTimeout(SocketAddr),

    /// Application data decrypted during the handshake could not be
    /// written to the backend.
    #[error("forwarding {len} buffered bytes to backend failed: {source}")]
    EarlyData {
        len: usize,
        #[source]
        source: io::Error,
    },

    /// Client and backend hops derived the same redirect key.
    #[error("client and backend connections share redirect key {0}")]
    KeyCollision(RedirectKey),

    /// Redirect map refused an entry.
    #[error(transparent)]
    Map(#[from] MapError),

    /// Kernel TLS could not be enabled on the client socket.
    #[error("kTLS offload failed: {0}")]
    Offload(#[from] OffloadError),

    /// Peer-close registration or wait failed.
    #[error("peer-close watch failed: {0}")]
    Watch(#[source] io::Error),

    /// Socket introspection failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SpliceError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SpliceError::Handshake(_) => "handshake_failed",
            SpliceError::HandshakeTimeout(_) => "handshake_timeout",
            SpliceError::UnconsumedPeek(_) => "unconsumed_peek",
            SpliceError::Dial { .. } => "dial_failed",
            SpliceError::DialTimeout(_) => "dial_timeout",
            SpliceError::EarlyData { .. } => "early_data_forward_failed",
            SpliceError::KeyCollision(_) => "key_collision",
            SpliceError::Map(_) => "map_update_failed",
            SpliceError::Offload(_) => "ktls_failed",
            SpliceError::Watch(_) => "watch_failed",
            SpliceError::Io(_) => "io_error",
        }
    }

    /// Whether the client is the likely cause (as opposed to this host).
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            SpliceError::Handshake(_) | SpliceError::HandshakeTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let err = SpliceError::DialTimeout("127.0.0.1:8080".parse().unwrap());
        assert_eq!(err.reason_code(), "dial_timeout");
        assert!(!err.is_client_fault());

        let err = SpliceError::HandshakeTimeout(Duration::from_secs(1));
        assert_eq!(err.reason_code(), "handshake_timeout");
        assert!(err.is_client_fault());
    }

    #[test]
    fn test_map_error_is_transparent() {
        let key = RedirectKey::derive(443, 1);
        let err = SpliceError::from(MapError::Insert {
            key,
            source: io::Error::other("full"),
        });
        assert_eq!(err.reason_code(), "map_update_failed");
        assert!(err.to_string().contains(&key.to_string()));
    }
}
