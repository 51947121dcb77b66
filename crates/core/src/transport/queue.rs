use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use super::TransportSink;
use crate::error::{Result, StreamError};
use crate::pipeline::Direction;

/// Default number of packets buffered per transport.
pub const DEFAULT_QUEUE_CAPACITY: usize = 512;

struct Queue {
    items: VecDeque<(Direction, Bytes)>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

/// Decouples fan-out from a slow sink.
///
/// [`send`](TransportSink::send) only enqueues; a worker thread drains the
/// queue into the wrapped sink in order. When the queue is full the oldest
/// packet is dropped, so a stalled client loses data instead of stalling
/// every other transport of the stream.
pub struct QueuedSink {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedSink {
    pub fn new(inner: Arc<dyn TransportSink>, capacity: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("transport-queue".to_string())
            .spawn(move || drain(worker_shared, inner))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Packets discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting packets and discard the backlog.
    ///
    /// Does not wait: a send already in progress finishes on the worker,
    /// which then exits. Returns the number of packets discarded.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut queue = self.shared.queue.lock();
            queue.closed = true;
            let discarded = queue.items.len();
            queue.items.clear();
            discarded
        };
        self.shared.ready.notify_all();
        if discarded > 0 {
            tracing::debug!(discarded, "transport queue closed with pending packets");
        }
        discarded
    }

    /// Stop accepting packets, deliver what is queued, and wait for the
    /// worker to finish. Blocks for as long as the wrapped sink does.
    pub fn flush(&self) {
        self.shared.queue.lock().closed = true;
        self.shared.ready.notify_all();
        if let Some(worker) = self.worker.lock().take()
            && worker.join().is_err()
        {
            tracing::warn!("transport queue worker panicked");
        }
    }
}

impl TransportSink for QueuedSink {
    fn send(&self, direction: Direction, packet: &Bytes) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            return Err(StreamError::PreconditionViolation("send on closed transport queue"));
        }
        if queue.items.len() >= self.shared.capacity {
            queue.items.pop_front();
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(dropped, "transport queue full, dropping oldest packet");
        }
        queue.items.push_back((direction, packet.clone()));
        drop(queue);
        self.shared.ready.notify_one();
        Ok(())
    }
}

impl Drop for QueuedSink {
    /// Never waits for the worker: it may be stuck in a stalled sink.
    fn drop(&mut self) {
        self.close();
    }
}

fn drain(shared: Arc<Shared>, inner: Arc<dyn TransportSink>) {
    loop {
        let (direction, packet) = {
            let mut queue = shared.queue.lock();
            while queue.items.is_empty() && !queue.closed {
                shared.ready.wait(&mut queue);
            }
            match queue.items.pop_front() {
                Some(item) => item,
                None => break,
            }
        };
        if let Err(e) = inner.send(direction, &packet) {
            tracing::debug!(%direction, error = %e, "queued send failed");
        }
    }
}
