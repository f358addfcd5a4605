//! # Pipe Multiplexer
//!
//! Copies one source byte stream to a changing set of destinations. A single loop reads
//! chunks from the source and writes each chunk to every destination registered at that
//! moment, waiting for all writes before reading the next chunk. Destinations can be
//! connected and disconnected while the loop runs; a destination that joins late only
//! sees bytes read after it joined.
//!
//! ## Readiness gate
//!
//! Until the first destination is connected or [`PipeMultiplexer::ready`] is called the
//! loop holds the chunk it has read instead of dropping it. Once the gate is open, chunks
//! read while nobody is connected are discarded. After [`PipeMultiplexer::complete`] has
//! been requested the remaining bytes are drained without dispatch.
//!
//! ## Shutdown
//!
//! On end of stream (or forced cancellation) every destination still connected is shut
//! down, which is how a downstream process sees EOF on its stdin. `complete` waits for
//! the loop to finish within a grace period and then cancels it.

use crate::collector::CollectorSink;
use crate::constants::{DEFAULT_PIPE_GRACE, READ_CHUNK_SIZE};
use futures::future::join_all;
use std::{
    fmt, io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Boxed byte stream read by a multiplexer.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed byte sink written by a multiplexer.
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Something a multiplexer writes to.
pub enum Destination {
    /// A raw byte sink: a console stream, a file, another process's stdin.
    Stream(ByteSink),
    /// One stream of an output collector.
    Collector(CollectorSink),
}

impl Destination {
    pub fn stream(sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Destination::Stream(Box::new(sink))
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            Destination::Stream(sink) => {
                sink.write_all(chunk).await?;
                sink.flush().await
            }
            Destination::Collector(sink) => {
                sink.write(chunk);
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        match self {
            Destination::Stream(sink) => sink.shutdown().await,
            Destination::Collector(_) => Ok(()),
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Stream(_) => f.write_str("Destination::Stream"),
            Destination::Collector(sink) => write!(f, "Destination::Collector({:?})", sink.kind()),
        }
    }
}

/// Handle returned by [`PipeMultiplexer::connect`], used to disconnect again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestinationId(u64);

type SharedDestination = Arc<tokio::sync::Mutex<Destination>>;

#[derive(Default)]
struct Registry {
    entries: Vec<(DestinationId, SharedDestination)>,
    closed: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Gate {
    ready: bool,
    shutdown: bool,
    connections: u64,
}

/// Single-reader, multi-writer fan-out over one byte stream.
pub struct PipeMultiplexer {
    name: String,
    source: Mutex<Option<ByteSource>>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    gate: watch::Sender<Gate>,
    finished: watch::Sender<bool>,
    cancel: CancellationToken,
    grace: Duration,
    stop_when_orphaned: AtomicBool,
}

impl PipeMultiplexer {
    pub fn new(name: impl Into<String>, source: impl AsyncRead + Send + Unpin + 'static) -> Arc<Self> {
        Self::with_grace(name, source, DEFAULT_PIPE_GRACE)
    }

    /// Creates a multiplexer whose [`complete`](Self::complete) waits at most `grace`
    /// before cancelling the loop.
    pub fn with_grace(
        name: impl Into<String>,
        source: impl AsyncRead + Send + Unpin + 'static,
        grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            source: Mutex::new(Some(Box::new(source))),
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(0),
            gate: watch::Sender::new(Gate::default()),
            finished: watch::Sender::new(false),
            cancel: CancellationToken::new(),
            grace,
            stop_when_orphaned: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a destination. Bytes read from now on are written to it.
    ///
    /// Connecting after the loop has finished closes the destination right away.
    pub fn connect(&self, destination: Destination) -> DestinationId {
        let id = DestinationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(tokio::sync::Mutex::new(destination));
        {
            let mut registry = self.lock_registry();
            if registry.closed {
                drop(registry);
                debug!("[{}] connect after end of stream, closing destination", self.name);
                close_detached(shared);
                return id;
            }
            registry.entries.push((id, shared));
        }
        self.gate.send_modify(|gate| gate.connections += 1);
        id
    }

    /// Connects a raw byte sink.
    pub fn connect_stream(&self, sink: impl AsyncWrite + Send + Unpin + 'static) -> DestinationId {
        self.connect(Destination::stream(sink))
    }

    /// Removes a destination without closing it. Returns whether it was connected.
    pub fn disconnect(&self, id: DestinationId) -> bool {
        let mut registry = self.lock_registry();
        let before = registry.entries.len();
        registry.entries.retain(|(entry, _)| *entry != id);
        before != registry.entries.len()
    }

    pub fn destination_count(&self) -> usize {
        self.lock_registry().entries.len()
    }

    /// Opens the readiness gate: chunks read while no destination is connected are dropped.
    pub fn ready(&self) {
        self.gate.send_if_modified(|gate| !std::mem::replace(&mut gate.ready, true));
    }

    /// Ends the loop once every destination has failed with a broken pipe, closing the
    /// source so the producer sees its reader go away.
    pub fn stop_when_orphaned(&self) {
        self.stop_when_orphaned.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Starts the read/dispatch loop on the current Tokio runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// The read/dispatch loop. Returns immediately if the loop already ran.
    pub async fn run(self: Arc<Self>) {
        self.pump().await;
    }

    async fn pump(&self) {
        let source = self.source.lock().expect("multiplexer source lock poisoned").take();
        let Some(mut source) = source else {
            return;
        };

        let mut gate = self.gate.subscribe();
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        let mut total = 0usize;

        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                read = source.read(&mut buffer) => read,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("[{}] source read failed: {}", self.name, e);
                    break;
                }
            };
            total += n;
            if !self.dispatch(&buffer[..n], &mut gate).await {
                break;
            }
        }

        debug!("[{}] loop finished after {} bytes", self.name, total);
        drop(source);
        self.close_all().await;
        self.finished.send_replace(true);
    }

    /// Writes one chunk to every destination. Returns `false` when cancelled.
    async fn dispatch(&self, chunk: &[u8], gate: &mut watch::Receiver<Gate>) -> bool {
        let targets = loop {
            let state = *gate.borrow_and_update();
            let targets = self.snapshot();
            if !targets.is_empty() {
                break targets;
            }
            if state.ready || state.shutdown {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = gate.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        };

        let writes = targets.into_iter().map(|(id, destination)| async move {
            let mut destination = destination.lock().await;
            match destination.write_chunk(chunk).await {
                Ok(()) => None,
                Err(e) => {
                    debug!("[{}] write to destination {:?} failed: {}", self.name, id, e);
                    (e.kind() == io::ErrorKind::BrokenPipe).then_some(id)
                }
            }
        });

        let broken: Vec<DestinationId> = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            results = join_all(writes) => results.into_iter().flatten().collect(),
        };
        if broken.is_empty() {
            return true;
        }

        let orphaned = {
            let mut registry = self.lock_registry();
            registry.entries.retain(|(id, _)| !broken.contains(id));
            registry.entries.is_empty()
        };
        !(orphaned && self.stop_when_orphaned.load(Ordering::Acquire))
    }

    fn snapshot(&self) -> Vec<(DestinationId, SharedDestination)> {
        self.lock_registry().entries.clone()
    }

    async fn close_all(&self) {
        let entries = {
            let mut registry = self.lock_registry();
            registry.closed = true;
            std::mem::take(&mut registry.entries)
        };
        for (id, destination) in entries {
            if let Err(e) = destination.lock().await.close().await {
                debug!("[{}] closing destination {:?} failed: {}", self.name, id, e);
            }
        }
    }

    /// Signals that no more destinations are coming and waits for the loop to drain.
    ///
    /// If the loop was never spawned it is driven here. If it has not finished within the
    /// grace period it is cancelled. Safe to call more than once and from several tasks.
    pub async fn complete(&self) {
        self.gate.send_if_modified(|gate| !std::mem::replace(&mut gate.shutdown, true));

        let mut finished = self.finished.subscribe();
        let drained = tokio::time::timeout(self.grace, async {
            self.pump().await;
            let _ = finished.wait_for(|done| *done).await;
        })
        .await
        .is_ok();
        if drained {
            return;
        }

        warn!(
            "[{}] did not drain within {:?}, cancelling",
            self.name, self.grace
        );
        self.cancel.cancel();
        let stopped = tokio::time::timeout(self.grace, finished.wait_for(|done| *done))
            .await
            .is_ok_and(|waited| waited.is_ok());
        if !stopped {
            self.close_all().await;
            self.finished.send_replace(true);
        }
    }

    /// Stops the loop immediately, closing the connected destinations.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().expect("multiplexer registry lock poisoned")
    }
}

impl fmt::Debug for PipeMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeMultiplexer")
            .field("name", &self.name)
            .field("destinations", &self.destination_count())
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn close_detached(destination: SharedDestination) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let _ = destination.lock().await.close().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{OutputCollector, StreamKind};
    use crate::utils::logging::init_test_logging;
    use encoding_rs::UTF_8;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn delivers_bytes_in_order_to_all_destinations() {
        init_test_logging();
        let mux = PipeMultiplexer::new("test", &b"hello multiplexer"[..]);
        let first = OutputCollector::new();
        let second = OutputCollector::new();
        mux.connect(Destination::Collector(first.sink(StreamKind::Stdout)));
        mux.connect(Destination::Collector(second.sink(StreamKind::Stdout)));

        mux.spawn().await.unwrap();

        assert_eq!(first.snapshot(0, UTF_8).stdout(), "hello multiplexer");
        assert_eq!(second.snapshot(0, UTF_8).stdout(), "hello multiplexer");
        assert!(mux.is_finished());
    }

    #[tokio::test]
    async fn holds_bytes_until_first_destination() {
        let (mut writer, reader) = duplex(64);
        let mux = PipeMultiplexer::new("gate", reader);
        let handle = mux.spawn();

        writer.write_all(b"early").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let collector = OutputCollector::new();
        mux.connect(Destination::Collector(collector.sink(StreamKind::Stdout)));
        writer.write_all(b" late").await.unwrap();
        drop(writer);
        handle.await.unwrap();

        assert_eq!(collector.snapshot(0, UTF_8).stdout(), "early late");
    }

    #[tokio::test]
    async fn ready_without_destinations_drops_bytes() {
        let (mut writer, reader) = duplex(64);
        let mux = PipeMultiplexer::new("ready", reader);
        mux.ready();
        let handle = mux.spawn();

        writer.write_all(b"lost").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let collector = OutputCollector::new();
        mux.connect(Destination::Collector(collector.sink(StreamKind::Stdout)));
        writer.write_all(b"kept").await.unwrap();
        drop(writer);
        handle.await.unwrap();

        assert_eq!(collector.snapshot(0, UTF_8).stdout(), "kept");
    }

    #[tokio::test]
    async fn disconnected_destination_stops_receiving() {
        let (mut writer, reader) = duplex(64);
        let mux = PipeMultiplexer::new("disconnect", reader);
        let keep = OutputCollector::new();
        let leave = OutputCollector::new();
        mux.connect(Destination::Collector(keep.sink(StreamKind::Stdout)));
        let leaving = mux.connect(Destination::Collector(leave.sink(StreamKind::Stdout)));
        let handle = mux.spawn();

        writer.write_all(b"both ").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mux.disconnect(leaving));
        assert!(!mux.disconnect(leaving));
        writer.write_all(b"one").await.unwrap();
        drop(writer);
        handle.await.unwrap();

        assert_eq!(keep.snapshot(0, UTF_8).stdout(), "both one");
        assert_eq!(leave.snapshot(0, UTF_8).stdout(), "both ");
    }

    #[tokio::test]
    async fn broken_destination_does_not_stop_the_others() {
        let (sink, sink_reader) = duplex(16);
        drop(sink_reader);

        let mux = PipeMultiplexer::new("broken", &b"still delivered"[..]);
        mux.connect_stream(sink);
        let collector = OutputCollector::new();
        mux.connect(Destination::Collector(collector.sink(StreamKind::Stdout)));
        mux.spawn().await.unwrap();

        assert_eq!(collector.snapshot(0, UTF_8).stdout(), "still delivered");
    }

    #[tokio::test]
    async fn orphaned_loop_stops_reading() {
        let (mut producer, reader) = duplex(64);
        let (sink, sink_reader) = duplex(64);
        drop(sink_reader);

        let mux = PipeMultiplexer::new("orphaned", reader);
        mux.stop_when_orphaned();
        mux.connect_stream(sink);
        let handle = mux.spawn();

        producer.write_all(b"nobody reads this").await.unwrap();
        handle.await.unwrap();
        assert!(mux.is_finished());
        assert_eq!(mux.destination_count(), 0);
        assert!(producer.write_all(b"more").await.is_err());
    }

    #[tokio::test]
    async fn end_of_stream_closes_stream_destinations() {
        let (sink, mut sink_reader) = duplex(64);
        let mux = PipeMultiplexer::new("close", &b"payload"[..]);
        mux.connect_stream(sink);
        mux.spawn();

        let mut received = Vec::new();
        sink_reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"payload");
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let mux = PipeMultiplexer::new("idempotent", &b"data"[..]);
        let collector = OutputCollector::new();
        mux.connect(Destination::Collector(collector.sink(StreamKind::Stdout)));
        mux.spawn();

        mux.complete().await;
        mux.complete().await;
        assert!(mux.is_finished());
        assert_eq!(collector.snapshot(0, UTF_8).stdout(), "data");
    }

    #[tokio::test]
    async fn complete_drains_without_destinations() {
        let mux = PipeMultiplexer::new("drain", &b"nobody listens"[..]);
        mux.spawn();
        mux.complete().await;
        assert!(mux.is_finished());
    }

    #[tokio::test]
    async fn complete_drives_a_loop_that_was_never_spawned() {
        let (sink, mut sink_reader) = duplex(64);
        let mux = PipeMultiplexer::new("unstarted", &b"read by complete"[..]);
        mux.connect_stream(sink);
        mux.complete().await;

        let mut received = Vec::new();
        sink_reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"read by complete");
        assert!(mux.is_finished());
    }

    #[tokio::test]
    async fn complete_cancels_stuck_source_after_grace() {
        let (_writer, reader) = duplex(64);
        let mux = PipeMultiplexer::with_grace("stuck", reader, Duration::from_millis(100));
        mux.ready();
        mux.spawn();

        let started = std::time::Instant::now();
        mux.complete().await;
        assert!(mux.is_finished());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn connect_after_finish_closes_destination() {
        let mux = PipeMultiplexer::new("late", &b""[..]);
        mux.spawn().await.unwrap();

        let (sink, mut sink_reader) = duplex(64);
        mux.connect_stream(sink);
        let mut received = Vec::new();
        sink_reader.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        assert_eq!(mux.destination_count(), 0);
    }
}
