//! Built-in logging backend.
//!
//! Accepts connections and logs each chunk it receives. Useful as a stand-in
//! backend when bringing up the splice on a new host.

use std::io;
use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn, Instrument};

const CHUNK_SIZE: usize = 1024;

/// Handle to a running sink.
#[derive(Debug, Clone)]
pub struct Sink {
    addr: SocketAddr,
}

impl Sink {
    /// Bind `addr` and serve in the background.
    pub async fn spawn(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!(addr = %addr, "Sink backend listening");
        tokio::spawn(accept_loop(listener));

        Ok(Self { addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

async fn accept_loop(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(
                    log_chunks(stream)
                        .instrument(tracing::info_span!("sink", peer = %peer)),
                );
            }
            Err(e) => {
                warn!(error = %e, "Sink accept failed, stopping");
                return;
            }
        }
    }
}

async fn log_chunks(mut stream: TcpStream) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                debug!("Sink connection closed");
                return;
            }
            Ok(n) => {
                info!(
                    bytes = n,
                    preview = %String::from_utf8_lossy(&buf[..n]),
                    "Sink received"
                );
            }
            Err(e) => {
                debug!(error = %e, "Sink read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    /// Send `data`, half-close, and wait for the sink to hang up after it
    /// has read everything.
    async fn send_and_wait_for_close(addr: SocketAddr, data: &[u8]) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(data).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0)), "sink wrote back: {read:?}");
    }

    #[tokio::test]
    async fn test_sink_drains_each_connection() {
        let sink = Sink::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();

        tokio::join!(
            send_and_wait_for_close(sink.addr(), b"hello"),
            send_and_wait_for_close(sink.addr(), &[0xff; 3 * CHUNK_SIZE]),
        );
    }
}
