//! SNI (Server Name Indication) extraction from a buffered ClientHello.
//!
//! The inspector peeks at the first TLS record of a connection and feeds it
//! to a throwaway rustls acceptor to read the requested server name. Nothing
//! is consumed: the handshake that follows sees the stream byte-identical.
//!
//! Defaults:
//! - sniff timeout: 200ms per peek
//!
//! A record that cannot be fully buffered within the timeout yields
//! [`SniResult::NoSni`]; the inspector never waits past that.

use std::io;
use std::time::Duration;

use rustls::server::Acceptor;
use tokio::io::AsyncRead;
use tokio::time::timeout;
use tracing::debug;

use super::peek::PeekedStream;

/// Default timeout for each sniffing peek.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(200);

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const SSLV2_HELLO_MARKER: u8 = 0x80;
const RECORD_HEADER_LEN: usize = 5;

/// Result of SNI inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// ClientHello carried a server name (normalized to lowercase).
    Found(String),
    /// TLS, but no server name could be read.
    NoSni,
    /// First byte is not a TLS handshake record.
    NotTls,
    /// Legacy SSLv2-framed hello.
    SslV2,
}

/// Configuration for SNI inspection.
#[derive(Debug, Clone)]
pub struct SniConfig {
    /// Maximum time to wait for each peek.
    pub timeout: Duration,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
        }
    }
}

/// Non-consuming SNI inspector.
#[derive(Debug, Clone, Default)]
pub struct SniInspector {
    config: SniConfig,
}

impl SniInspector {
    /// Create a new SNI inspector with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new SNI inspector with custom configuration.
    pub fn with_config(config: SniConfig) -> Self {
        Self { config }
    }

    /// Inspect the start of `stream` for a server name.
    ///
    /// Fails only if the very first byte cannot be read. Every byte the
    /// inspector reads remains buffered in `stream` for replay.
    pub async fn inspect<S: AsyncRead + Unpin>(
        &self,
        stream: &mut PeekedStream<S>,
    ) -> io::Result<SniResult> {
        let first = self.peek(stream, 1).await?[0];
        if first != CONTENT_TYPE_HANDSHAKE {
            if first == SSLV2_HELLO_MARKER {
                return Ok(SniResult::SslV2);
            }
            return Ok(SniResult::NotTls);
        }

        let record_len = match self.peek(stream, RECORD_HEADER_LEN).await {
            Ok(header) => u16::from_be_bytes([header[3], header[4]]) as usize,
            Err(e) => {
                debug!(error = %e, "TLS record header unavailable");
                return Ok(SniResult::NotTls);
            }
        };

        let record = match self.peek(stream, RECORD_HEADER_LEN + record_len).await {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, record_len, "ClientHello record incomplete");
                return Ok(SniResult::NoSni);
            }
        };

        Ok(match client_hello_server_name(record) {
            Some(name) => SniResult::Found(normalize_hostname(&name)),
            None => SniResult::NoSni,
        })
    }

    async fn peek<'a, S: AsyncRead + Unpin>(
        &self,
        stream: &'a mut PeekedStream<S>,
        n: usize,
    ) -> io::Result<&'a [u8]> {
        match timeout(self.config.timeout, stream.peek(n)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "SNI sniff timeout")),
        }
    }
}

/// Run a throwaway acceptor over one buffered record. Any error it reports is
/// discarded.
fn client_hello_server_name(mut record: &[u8]) -> Option<String> {
    let mut acceptor = Acceptor::default();

    while !record.is_empty() {
        match acceptor.read_tls(&mut record) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    match acceptor.accept() {
        Ok(Some(accepted)) => accepted.client_hello().server_name().map(str::to_owned),
        Ok(None) | Err(_) => None,
    }
}

fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}
