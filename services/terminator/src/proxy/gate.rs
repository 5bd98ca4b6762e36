//! User-space TLS handshake.
//!
//! The gate runs the handshake to completion, flushes the final flight, and
//! hands back the raw socket together with the session whose secrets will be
//! installed into kernel TLS.
//!
//! A client may send its first request in the same segment as its Finished
//! message. rustls decrypts those records while completing the handshake and
//! keeps the plaintext; extracting the secrets would discard it. The gate
//! drains that plaintext so it can be forwarded to the backend ahead of the
//! kernel data path.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustls::{ServerConfig, ServerConnection};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::peek::PeekedStream;
use crate::SpliceError;

/// Default handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts client handshakes with a fixed server config.
#[derive(Clone)]
pub struct HandshakeGate {
    acceptor: TlsAcceptor,
    timeout: Duration,
}

/// A stream whose handshake has completed.
pub struct Handshaken<IO> {
    stream: IO,
    session: ServerConnection,
    early_data: Bytes,
}

impl HandshakeGate {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self::with_timeout(config, DEFAULT_HANDSHAKE_TIMEOUT)
    }

    pub fn with_timeout(config: Arc<ServerConfig>, timeout: Duration) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            timeout,
        }
    }

    /// Complete the handshake on `io`.
    ///
    /// On failure `io` is dropped, which closes the connection.
    pub async fn accept<IO>(&self, io: IO) -> Result<Handshaken<IO>, SpliceError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = async {
            let mut tls = self.acceptor.accept(io).await?;
            tls.flush().await?;
            Ok::<_, io::Error>(tls)
        };

        let tls = match timeout(self.timeout, handshake).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => return Err(SpliceError::Handshake(e)),
            Err(_) => return Err(SpliceError::HandshakeTimeout(self.timeout)),
        };

        let (stream, mut session) = tls.into_inner();
        let early_data = drain_plaintext(&mut session).map_err(SpliceError::Handshake)?;
        debug!(
            protocol = ?session.protocol_version(),
            cipher_suite = ?session.negotiated_cipher_suite().map(|s| s.suite()),
            sni = session.server_name(),
            early_data = early_data.len(),
            "Handshake complete"
        );

        Ok(Handshaken {
            stream,
            session,
            early_data,
        })
    }
}

/// Take every byte of decrypted application data rustls is holding.
fn drain_plaintext(session: &mut ServerConnection) -> io::Result<Bytes> {
    let mut drained = BytesMut::new();
    let mut buf = [0u8; 4096];
    loop {
        match session.reader().read(&mut buf) {
            // close_notify: nothing more will follow.
            Ok(0) => break,
            Ok(n) => drained.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(drained.freeze())
}

impl<IO> Handshaken<IO> {
    pub fn session(&self) -> &ServerConnection {
        &self.session
    }

    /// Application data that arrived with the client's final flight.
    pub fn early_data(&self) -> &[u8] {
        &self.early_data
    }
}

impl<S> Handshaken<PeekedStream<S>> {
    /// Unwrap the raw socket, the session and any drained application data.
    ///
    /// Fails if any replayed byte was left unread by the handshake: those
    /// bytes would otherwise be lost to the kernel record layer.
    pub fn into_socket(self) -> Result<(S, ServerConnection, Bytes), SpliceError> {
        let (unread, socket) = self.stream.into_parts();
        if !unread.is_empty() {
            return Err(SpliceError::UnconsumedPeek(unread.len()));
        }
        Ok((socket, self.session, self.early_data))
    }
}
