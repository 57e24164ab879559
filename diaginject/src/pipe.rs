//! In-memory byte pipe between the tar producer and the exec stdin pump.
//!
//! The pipe is a bounded `tokio::io::duplex`, so the producer is throttled
//! by the remote `tar`. Either half can be force-closed from outside through
//! a [`PipeHandle`]; closing is idempotent and wakes any pending read or
//! write, which then fails with `BrokenPipe`.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Create a pipe with `capacity` bytes of buffering.
pub fn byte_pipe(capacity: usize) -> (PipeReader, PipeWriter, PipeHandle) {
    let (write_side, read_side) = tokio::io::duplex(capacity.max(1));
    let handle = PipeHandle {
        reader: CancellationToken::new(),
        writer: CancellationToken::new(),
    };

    let reader = PipeReader {
        inner: read_side,
        closed: Closed::new(handle.reader.clone()),
    };
    let writer = PipeWriter {
        inner: write_side,
        closed: Closed::new(handle.writer.clone()),
    };

    (reader, writer, handle)
}

/// Out-of-band close switch for both halves of a pipe.
#[derive(Clone, Debug)]
pub struct PipeHandle {
    reader: CancellationToken,
    writer: CancellationToken,
}

impl PipeHandle {
    pub fn close_writer(&self) {
        self.writer.cancel();
    }

    pub fn close_reader(&self) {
        self.reader.cancel();
    }

    /// Close the writer, then the reader.
    pub fn close(&self) {
        self.close_writer();
        self.close_reader();
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_cancelled() && self.reader.is_cancelled()
    }
}

struct Closed {
    token: CancellationToken,
    wait: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl Closed {
    fn new(token: CancellationToken) -> Self {
        let wait = Box::pin(token.clone().cancelled_owned());
        Self { token, wait }
    }

    /// Ready once the half has been force-closed; registers the waker otherwise.
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.wait.as_mut().poll(cx).is_ready()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")
}

/// Read half; handed to the exec transport as stdin.
pub struct PipeReader {
    inner: DuplexStream,
    closed: Closed,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed.poll_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// Write half; owned by the tar producer.
pub struct PipeWriter {
    inner: DuplexStream,
    closed: Closed,
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed.poll_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed.token.is_cancelled() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed.token.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
