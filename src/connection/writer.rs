// src/connection/writer.rs

//! Per-session outbound coalescing.
//!
//! Every session owns one `CoalescingWriter` wrapping its transport sink.
//! Non-urgent messages are buffered and flushed as one `BATCH` envelope when
//! any trigger fires: queue length, queued bytes, or elapsed delay since the
//! first unflushed enqueue. Urgent messages bypass the queue entirely.

use crate::core::protocol::codec::{WireFormat, encode_batch_envelope, encode_server_message};
use crate::core::protocol::ServerMessage;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Batching triggers. Any single trigger forces an immediate flush.
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub max_batch_size: usize,
    pub max_delay: Duration,
    pub max_batch_bytes: usize,
}

impl WriterConfig {
    pub fn conservative() -> Self {
        Self {
            max_batch_size: 100,
            max_delay: Duration::from_millis(2),
            max_batch_bytes: 64 * 1024,
        }
    }

    pub fn balanced() -> Self {
        Self {
            max_batch_size: 300,
            max_delay: Duration::from_millis(2),
            max_batch_bytes: 128 * 1024,
        }
    }

    pub fn high_throughput() -> Self {
        Self {
            max_batch_size: 500,
            max_delay: Duration::from_millis(2),
            max_batch_bytes: 256 * 1024,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            max_batch_size: 1000,
            max_delay: Duration::from_millis(5),
            max_batch_bytes: 512 * 1024,
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "conservative" => Some(Self::conservative()),
            "balanced" => Some(Self::balanced()),
            "high_throughput" | "highThroughput" => Some(Self::high_throughput()),
            "aggressive" => Some(Self::aggressive()),
            _ => None,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

/// Writer throughput counters.
#[derive(Debug, Default)]
pub struct WriterMetrics {
    pub messages_sent: AtomicU64,
    pub batches_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub immediate_flushes: AtomicU64,
    pub timed_flushes: AtomicU64,
}

impl WriterMetrics {
    /// Average messages per flushed batch divided by `max_batch_size`.
    pub fn batch_utilization(&self, config: &WriterConfig) -> f64 {
        let batches = self.batches_sent.load(Ordering::Relaxed);
        if batches == 0 || config.max_batch_size == 0 {
            return 0.0;
        }
        let messages = self.messages_sent.load(Ordering::Relaxed);
        (messages as f64 / batches as f64) / config.max_batch_size as f64
    }
}

#[derive(Debug, Default)]
struct WriteQueue {
    frames: Vec<Bytes>,
    bytes: usize,
    /// Generation counter; a scheduled delayed flush only fires if the queue
    /// it saw is still the pending one.
    generation: u64,
    flush_scheduled: bool,
}

/// Wraps one outbound transport sink with size/byte/time coalescing.
#[derive(Debug)]
pub struct CoalescingWriter {
    config: WriterConfig,
    sink: mpsc::UnboundedSender<Bytes>,
    queue: Mutex<WriteQueue>,
    format: AtomicU8,
    closed: AtomicBool,
    pub metrics: WriterMetrics,
}

impl CoalescingWriter {
    pub fn new(sink: mpsc::UnboundedSender<Bytes>, config: WriterConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sink,
            queue: Mutex::new(WriteQueue::default()),
            format: AtomicU8::new(0),
            closed: AtomicBool::new(false),
            metrics: WriterMetrics::default(),
        })
    }

    /// Switches the serialization format to match the session's last inbound
    /// frame.
    pub fn set_format(&self, format: WireFormat) {
        self.format.store(
            match format {
                WireFormat::Binary => 0,
                WireFormat::Json => 1,
            },
            Ordering::Relaxed,
        );
    }

    pub fn format(&self) -> WireFormat {
        match self.format.load(Ordering::Relaxed) {
            0 => WireFormat::Binary,
            _ => WireFormat::Json,
        }
    }

    /// Serializes and enqueues a message. Urgent messages are sent before any
    /// scheduled flush, bypassing the queue.
    pub fn write(self: &Arc<Self>, message: &ServerMessage, urgent: bool) {
        let payload = match encode_server_message(message, self.format()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping unserializable outbound message: {}", e);
                return;
            }
        };
        self.write_raw(payload, urgent);
    }

    /// Enqueues a preserialized payload.
    pub fn write_raw(self: &Arc<Self>, payload: Bytes, urgent: bool) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if urgent {
            self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
            self.send_to_sink(payload);
            return;
        }

        let should_flush;
        let schedule_delay;
        {
            let mut queue = self.queue.lock();
            queue.bytes += payload.len();
            queue.frames.push(payload);
            should_flush = queue.frames.len() >= self.config.max_batch_size
                || queue.bytes >= self.config.max_batch_bytes;
            schedule_delay = !should_flush && !queue.flush_scheduled;
            if schedule_delay {
                queue.flush_scheduled = true;
            }
        }

        if should_flush {
            self.metrics.immediate_flushes.fetch_add(1, Ordering::Relaxed);
            self.flush();
        } else if schedule_delay {
            let writer = self.clone();
            let generation = writer.queue.lock().generation;
            tokio::spawn(async move {
                tokio::time::sleep(writer.config.max_delay).await;
                let still_pending = {
                    let queue = writer.queue.lock();
                    queue.generation == generation && !queue.frames.is_empty()
                };
                if still_pending {
                    writer.metrics.timed_flushes.fetch_add(1, Ordering::Relaxed);
                    writer.flush();
                }
            });
        }
    }

    /// Drains the queue synchronously. A single queued message goes out raw;
    /// multiple messages are wrapped in one `BATCH` envelope.
    pub fn flush(self: &Arc<Self>) {
        let frames = {
            let mut queue = self.queue.lock();
            queue.generation = queue.generation.wrapping_add(1);
            queue.flush_scheduled = false;
            queue.bytes = 0;
            std::mem::take(&mut queue.frames)
        };
        match frames.len() {
            0 => {}
            1 => {
                self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.send_to_sink(frames.into_iter().next().expect("len checked"));
            }
            n => {
                let (count, data) = encode_batch_envelope(&frames);
                let envelope = ServerMessage::Batch { count, data };
                match encode_server_message(&envelope, self.format()) {
                    Ok(payload) => {
                        self.metrics
                            .messages_sent
                            .fetch_add(n as u64, Ordering::Relaxed);
                        self.metrics.batches_sent.fetch_add(1, Ordering::Relaxed);
                        self.send_to_sink(payload);
                    }
                    Err(e) => warn!("Dropping {} coalesced messages: {}", n, e),
                }
            }
        }
    }

    /// Messages still queued and unflushed.
    pub fn pending_depth(&self) -> usize {
        self.queue.lock().frames.len()
    }

    /// Flushes, then marks the writer closed. Idempotent.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // One last drain; the closed flag only gates new writes.
        let frames = {
            let mut queue = self.queue.lock();
            queue.generation = queue.generation.wrapping_add(1);
            queue.bytes = 0;
            std::mem::take(&mut queue.frames)
        };
        for frame in frames {
            self.send_to_sink(frame);
        }
    }

    // A closed or congested socket is not an error here: the close path owns
    // cleanup, and ack accounting lives in the write-concern tracker.
    fn send_to_sink(&self, payload: Bytes) {
        self.metrics
            .bytes_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        if self.sink.send(payload).is_err() {
            debug!("Discarding outbound frame for a closing connection");
        }
    }
}

