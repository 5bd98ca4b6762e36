//! Replayable read-ahead over a byte stream.
//!
//! [`PeekedStream`] lets a caller look at the first bytes of a connection and
//! then hand the stream on as if nothing had been read: peeked bytes are
//! returned by the next reads, in order, before any fresh bytes from the
//! underlying stream.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// A stream with a replay buffer in front of its read half.
#[derive(Debug)]
pub struct PeekedStream<S> {
    peeked: BytesMut,
    inner: S,
}

impl<S> PeekedStream<S> {
    /// Wrap a stream with an empty replay buffer.
    pub fn new(inner: S) -> Self {
        Self {
            peeked: BytesMut::new(),
            inner,
        }
    }

    /// Bytes read ahead but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.peeked
    }

    /// Split into the unconsumed replay bytes and the underlying stream.
    pub fn into_parts(self) -> (Bytes, S) {
        (self.peeked.freeze(), self.inner)
    }
}

impl<S: AsyncRead + Unpin> PeekedStream<S> {
    /// Return the first `n` bytes of the stream without consuming them.
    ///
    /// Reads from the underlying stream only as far as needed. If the stream
    /// ends first, fails with `UnexpectedEof`; whatever was read stays
    /// buffered for replay.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.peeked.len() < n {
            self.peeked.reserve(n - self.peeked.len());
            if self.inner.read_buf(&mut self.peeked).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "stream ended after {} of {} peeked bytes",
                        self.peeked.len(),
                        n
                    ),
                ));
            }
        }
        Ok(&self.peeked[..n])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.peeked.is_empty() {
            let n = this.peeked.len().min(buf.remaining());
            buf.put_slice(&this.peeked[..n]);
            this.peeked.advance(n);
            if this.peeked.is_empty() {
                // Release the allocation once replay is done.
                this.peeked = BytesMut::new();
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: AsFd> AsFd for PeekedStream<S> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl<S: AsRawFd> AsRawFd for PeekedStream<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
