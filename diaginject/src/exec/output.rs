//! Local destinations for remote output.
//!
//! [`CaptureBuffer`] keeps bytes for the caller to inspect after the exec
//! returns. [`DiagnosticSink`] forwards each line to `tracing` instead; it is
//! where output nobody captures ends up.

use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

/// Shared in-memory buffer; clones write to the same bytes.
#[derive(Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsyncWrite for CaptureBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Log level for a forwarded stream.
#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Debug,
    Warn,
}

/// Forwards remote output to the host's tracing system, one event per line.
pub struct DiagnosticSink {
    label: String,
    stream: &'static str,
    level: LogLevel,
    pending: Vec<u8>,
}

impl DiagnosticSink {
    /// `label` identifies the exec (pod and step); `stream` is "stdout" or "stderr".
    pub fn new(label: impl Into<String>, stream: &'static str, level: LogLevel) -> Self {
        Self {
            label: label.into(),
            stream,
            level,
            pending: Vec::new(),
        }
    }

    /// Removes terminal escape sequences from a line.
    ///
    /// Covers CSI sequences (`ESC [ params final`, so colours as well as
    /// cursor and erase codes) and two-byte `ESC x` escapes.
    fn strip_ansi_codes(text: &str) -> String {
        let mut result = String::with_capacity(text.len());
        let mut chars = text.chars();

        while let Some(c) = chars.next() {
            if c != '\x1b' {
                result.push(c);
                continue;
            }
            if chars.next() == Some('[') {
                // Parameter and intermediate bytes run until a final byte in '@'..='~'.
                let _ = chars.by_ref().find(|ch| ('@'..='~').contains(ch));
            }
        }

        result
    }

    fn emit(&self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let line = Self::strip_ansi_codes(text.trim_end_matches(['\r', '\n']));
        if line.is_empty() {
            return;
        }
        match self.level {
            LogLevel::Debug => {
                tracing::debug!(exec = %self.label, stream = self.stream, "{}", line)
            }
            LogLevel::Warn => {
                tracing::warn!(exec = %self.label, stream = self.stream, "{}", line)
            }
        }
    }

    fn flush_lines(&mut self) {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line);
        }
    }

    fn flush_rest(&mut self) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.emit(&rest);
        }
    }
}

impl AsyncWrite for DiagnosticSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.pending.extend_from_slice(buf);
        this.flush_lines();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().flush_rest();
        Poll::Ready(Ok(()))
    }
}

impl Drop for DiagnosticSink {
    fn drop(&mut self) {
        self.flush_rest();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_capture_buffer_clones_share_bytes() {
        let buffer = CaptureBuffer::new();
        let mut writer = buffer.clone();
        writer.write_all(b"line one\n").await.unwrap();
        writer.write_all(b"line two\n").await.unwrap();
        assert_eq!(buffer.text(), "line one\nline two\n");
        assert_eq!(buffer.len(), 18);
    }

    #[test]
    fn test_strip_ansi_codes() {
        assert_eq!(
            DiagnosticSink::strip_ansi_codes("\x1b[32mok\x1b[0m done"),
            "ok done"
        );
        assert_eq!(DiagnosticSink::strip_ansi_codes("plain"), "plain");
    }

    #[test]
    fn test_strip_ansi_codes_handles_cursor_and_erase_sequences() {
        assert_eq!(
            DiagnosticSink::strip_ansi_codes("\x1b[2K\x1b[1;31mCollecting javacores\x1b[0m\x1b[1A"),
            "Collecting javacores"
        );
        assert_eq!(DiagnosticSink::strip_ansi_codes("\x1b7saved\x1b8"), "saved");
        assert_eq!(DiagnosticSink::strip_ansi_codes("cut\x1b[12"), "cut");
    }

    #[tokio::test]
    async fn test_sink_splits_lines_and_keeps_partial_tail() {
        let mut sink = DiagnosticSink::new("ns/pod extract", "stderr", LogLevel::Warn);
        sink.write_all(b"first\nsec").await.unwrap();
        assert_eq!(sink.pending, b"sec");
        sink.write_all(b"ond\n").await.unwrap();
        assert!(sink.pending.is_empty());
        sink.write_all(b"tail").await.unwrap();
        sink.shutdown().await.unwrap();
        assert!(sink.pending.is_empty());
    }
}
