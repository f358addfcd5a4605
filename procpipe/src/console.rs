//! # Console Boundary
//!
//! Jobs never touch the process's real stdio directly. They go through a
//! [`ConsoleProvider`], which hands out byte streams, text writers and redirection flags.
//! [`SystemConsole`] is backed by the real standard streams; [`MemoryConsole`] keeps
//! everything in memory so tests can drive jobs without a terminal.
//!
//! Each provider also owns one [`PipeMultiplexer`] over its own standard input, created
//! on first use. Jobs that auto-wire stdin connect to it for the time they run, so
//! consecutive jobs share the host input without losing bytes in between.
//!
//! The console's encodings are applied at the boundary: bytes echoed from a process are
//! re-encoded from the process encoding to [`ConsoleProvider::output_encoding`], and
//! auto-wired input is re-encoded from [`ConsoleProvider::input_encoding`] to the
//! process encoding (see [`transcode`]).

use crate::multiplexer::{ByteSink, ByteSource, PipeMultiplexer};
use encoding_rs::{CoderResult, Decoder, Encoder, Encoding, UTF_8};
use std::{
    io::{self, IsTerminal, Write},
    pin::Pin,
    sync::{Arc, Mutex, OnceLock},
    task::{Context, Poll, ready},
};
use tokio::io::AsyncWrite;

/// Streams and flags a job needs from its hosting console.
pub trait ConsoleProvider: Send + Sync {
    fn open_standard_input(&self) -> ByteSource;
    fn open_standard_output(&self) -> ByteSink;
    fn open_standard_error(&self) -> ByteSink;

    fn input_encoding(&self) -> &'static Encoding {
        UTF_8
    }

    fn output_encoding(&self) -> &'static Encoding {
        UTF_8
    }

    fn is_input_redirected(&self) -> bool;

    fn write_out_line(&self, line: &str);
    fn write_error_line(&self, line: &str);

    /// Process-wide multiplexer over this console's standard input.
    fn input_multiplexer(&self) -> Arc<PipeMultiplexer>;
}

fn lazy_input_multiplexer(
    cell: &OnceLock<Arc<PipeMultiplexer>>,
    open: impl FnOnce() -> ByteSource,
) -> Arc<PipeMultiplexer> {
    Arc::clone(cell.get_or_init(|| {
        let mux = PipeMultiplexer::new("console-stdin", open());
        mux.spawn();
        mux
    }))
}

/// The real standard streams of this process.
#[derive(Debug, Default)]
pub struct SystemConsole {
    input: OnceLock<Arc<PipeMultiplexer>>,
}

impl SystemConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared instance used by the default environment.
    pub fn shared() -> Arc<SystemConsole> {
        static SHARED: OnceLock<Arc<SystemConsole>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(SystemConsole::new())))
    }
}

impl ConsoleProvider for SystemConsole {
    fn open_standard_input(&self) -> ByteSource {
        Box::new(tokio::io::stdin())
    }

    fn open_standard_output(&self) -> ByteSink {
        Box::new(tokio::io::stdout())
    }

    fn open_standard_error(&self) -> ByteSink {
        Box::new(tokio::io::stderr())
    }

    fn is_input_redirected(&self) -> bool {
        !std::io::stdin().is_terminal()
    }

    fn write_out_line(&self, line: &str) {
        let _ = writeln!(std::io::stdout().lock(), "{line}");
    }

    fn write_error_line(&self, line: &str) {
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    }

    fn input_multiplexer(&self) -> Arc<PipeMultiplexer> {
        lazy_input_multiplexer(&self.input, || self.open_standard_input())
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// An `AsyncWrite` that appends to a shared in-memory buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    buffer: SharedBuffer,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.buffer
            .lock()
            .expect("memory console lock poisoned")
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A console that lives entirely in memory.
///
/// Input is a fixed byte buffer. Setting input makes the console report its input as
/// redirected, which is what triggers stdin auto-wiring in jobs. Everything written to
/// stdout or stderr, as bytes or as text lines, is kept for inspection.
#[derive(Debug)]
pub struct MemoryConsole {
    input: Option<Vec<u8>>,
    stdout: MemoryWriter,
    stderr: MemoryWriter,
    input_encoding: &'static Encoding,
    output_encoding: &'static Encoding,
    input_mux: OnceLock<Arc<PipeMultiplexer>>,
}

impl Default for MemoryConsole {
    fn default() -> Self {
        Self {
            input: None,
            stdout: MemoryWriter::default(),
            stderr: MemoryWriter::default(),
            input_encoding: UTF_8,
            output_encoding: UTF_8,
            input_mux: OnceLock::new(),
        }
    }
}

impl MemoryConsole {
    /// A console with no input and interactive (non-redirected) streams.
    pub fn new() -> Self {
        Self::default()
    }

    /// A console whose redirected standard input yields `input`.
    pub fn with_input(input: impl Into<Vec<u8>>) -> Self {
        Self {
            input: Some(input.into()),
            ..Self::default()
        }
    }

    /// Declares the encodings of the console's input and output streams.
    pub fn with_encodings(mut self, input: &'static Encoding, output: &'static Encoding) -> Self {
        self.input_encoding = input;
        self.output_encoding = output;
        self
    }

    pub fn stdout_bytes(&self) -> Vec<u8> {
        snapshot(&self.stdout.buffer)
    }

    pub fn stderr_bytes(&self) -> Vec<u8> {
        snapshot(&self.stderr.buffer)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout_bytes()).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr_bytes()).into_owned()
    }
}

fn snapshot(buffer: &SharedBuffer) -> Vec<u8> {
    buffer.lock().expect("memory console lock poisoned").clone()
}

fn append_line(buffer: &SharedBuffer, line: &str) {
    let mut buffer = buffer.lock().expect("memory console lock poisoned");
    buffer.extend_from_slice(line.as_bytes());
    buffer.push(b'\n');
}

impl ConsoleProvider for MemoryConsole {
    fn open_standard_input(&self) -> ByteSource {
        Box::new(std::io::Cursor::new(self.input.clone().unwrap_or_default()))
    }

    fn open_standard_output(&self) -> ByteSink {
        Box::new(self.stdout.clone())
    }

    fn open_standard_error(&self) -> ByteSink {
        Box::new(self.stderr.clone())
    }

    fn is_input_redirected(&self) -> bool {
        self.input.is_some()
    }

    fn input_encoding(&self) -> &'static Encoding {
        self.input_encoding
    }

    fn output_encoding(&self) -> &'static Encoding {
        self.output_encoding
    }

    fn write_out_line(&self, line: &str) {
        append_line(&self.stdout.buffer, line);
    }

    fn write_error_line(&self, line: &str) {
        append_line(&self.stderr.buffer, line);
    }

    fn input_multiplexer(&self) -> Arc<PipeMultiplexer> {
        lazy_input_multiplexer(&self.input_mux, || self.open_standard_input())
    }
}

/// Wraps `sink` so bytes written in `from` arrive encoded as `to`.
///
/// Returns `sink` unchanged when both encodings are the same. Characters split across
/// writes are carried over to the next write; shutdown flushes what is left.
pub fn transcode(sink: ByteSink, from: &'static Encoding, to: &'static Encoding) -> ByteSink {
    if from == to {
        return sink;
    }
    Box::new(TranscodingWriter {
        inner: sink,
        decoder: from.new_decoder_without_bom_handling(),
        encoder: to.new_encoder(),
        pending: Vec::new(),
        finished: false,
    })
}

struct TranscodingWriter {
    inner: ByteSink,
    decoder: Decoder,
    encoder: Encoder,
    pending: Vec<u8>,
    finished: bool,
}

impl TranscodingWriter {
    fn convert(&mut self, input: &[u8], last: bool) {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(input.len())
            .unwrap_or(input.len() * 3 + 16);
        let mut text = String::with_capacity(capacity);
        let _ = self.decoder.decode_to_string(input, &mut text, last);

        let mut remaining = text.as_str();
        loop {
            let reserve = self
                .encoder
                .max_buffer_length_from_utf8_if_no_unmappables(remaining.len())
                .unwrap_or(remaining.len() * 4 + 16);
            self.pending.reserve(reserve);
            let (result, read, _) = self.encoder.encode_from_utf8_to_vec(remaining, &mut self.pending, last);
            remaining = &remaining[read..];
            if let CoderResult::InputEmpty = result {
                break;
            }
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.drain(..written);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TranscodingWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        this.convert(buf, false);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.finished {
            this.convert(&[], true);
            this.finished = true;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{OutputCollector, StreamKind};
    use crate::multiplexer::Destination;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn memory_console_captures_streams_and_lines() {
        let console = MemoryConsole::new();
        let mut out = console.open_standard_output();
        out.write_all(b"raw ").await.unwrap();
        console.write_out_line("line");
        console.write_error_line("oops");

        assert_eq!(console.stdout_text(), "raw line\n");
        assert_eq!(console.stderr_text(), "oops\n");
        assert!(!console.is_input_redirected());
    }

    #[tokio::test]
    async fn memory_console_input_is_redirected() {
        let console = MemoryConsole::with_input("abc");
        assert!(console.is_input_redirected());

        let mut input = console.open_standard_input();
        let mut read = String::new();
        input.read_to_string(&mut read).await.unwrap();
        assert_eq!(read, "abc");
    }

    #[tokio::test]
    async fn transcode_re_encodes_split_characters() {
        let console = MemoryConsole::new().with_encodings(UTF_8, encoding_rs::WINDOWS_1252);
        let mut out = transcode(console.open_standard_output(), UTF_8, console.output_encoding());
        // "é" is 0xC3 0xA9 in UTF-8; split it across two writes.
        out.write_all(b"caf\xC3").await.unwrap();
        out.write_all(b"\xA9!").await.unwrap();
        out.shutdown().await.unwrap();
        assert_eq!(console.stdout_bytes(), vec![b'c', b'a', b'f', 0xE9, b'!']);
    }

    #[tokio::test]
    async fn transcode_is_a_no_op_for_equal_encodings() {
        let console = MemoryConsole::new();
        let mut out = transcode(console.open_standard_output(), UTF_8, UTF_8);
        out.write_all("é".as_bytes()).await.unwrap();
        assert_eq!(console.stdout_text(), "é");
        assert_eq!(console.input_encoding(), UTF_8);
    }

    #[tokio::test]
    async fn input_multiplexer_is_created_once() {
        let console = MemoryConsole::with_input("shared input");
        let first = console.input_multiplexer();
        let second = console.input_multiplexer();
        assert!(Arc::ptr_eq(&first, &second));

        let collector = OutputCollector::new();
        first.connect(Destination::Collector(collector.sink(StreamKind::Stdout)));
        first.complete().await;
        assert_eq!(collector.snapshot(0, UTF_8).stdout(), "shared input");
    }
}
