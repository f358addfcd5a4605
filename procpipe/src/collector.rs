//! # Output Collector
//!
//! Append-only capture of a job's stdout and stderr. Every append lands in the stream's
//! own buffer and in the combined buffer under a single lock, so `combined` is the exact
//! arrival-order interleaving of both streams and each stream buffer is the matching
//! subsequence of it.

use crate::output::ProcessOutput;
use bytes::Bytes;
use encoding_rs::Encoding;
use std::sync::{Arc, Mutex};

/// Which process stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct Buffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
}

/// Shared capture buffers for one job.
#[derive(Debug, Clone, Default)]
pub struct OutputCollector {
    buffers: Arc<Mutex<Buffers>>,
}

impl OutputCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk read from `kind`.
    pub fn append(&self, kind: StreamKind, chunk: &[u8]) {
        let mut buffers = self.lock();
        match kind {
            StreamKind::Stdout => buffers.stdout.extend_from_slice(chunk),
            StreamKind::Stderr => buffers.stderr.extend_from_slice(chunk),
        }
        buffers.combined.extend_from_slice(chunk);
    }

    /// A multiplexer destination feeding one stream of this collector.
    pub fn sink(&self, kind: StreamKind) -> CollectorSink {
        CollectorSink {
            collector: self.clone(),
            kind,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().combined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current buffers into an immutable [`ProcessOutput`].
    pub fn snapshot(&self, exit_code: i32, encoding: &'static Encoding) -> ProcessOutput {
        let buffers = self.lock();
        ProcessOutput::new(
            exit_code,
            Bytes::copy_from_slice(&buffers.stdout),
            Bytes::copy_from_slice(&buffers.stderr),
            Bytes::copy_from_slice(&buffers.combined),
            encoding,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Buffers> {
        self.buffers.lock().expect("collector lock poisoned")
    }
}

/// Writes chunks of one stream into an [`OutputCollector`].
#[derive(Debug, Clone)]
pub struct CollectorSink {
    collector: OutputCollector,
    kind: StreamKind,
}

impl CollectorSink {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn write(&self, chunk: &[u8]) {
        self.collector.append(self.kind, chunk);
    }
}
