//! Decoupled persistence hand-off.
//!
//! Capture threads hand flow snapshots to an [`Ingestor`]; a pool of batch
//! workers drains the shared queue and writes batches to a [`FlowSink`].
//!
//! ```text
//! capture thread 0 --+
//! capture thread 1 --+--[bounded MPMC queue]--+--> BatchWorker 0 --> sink 0
//! ...                |                        +--> BatchWorker 1 --> sink 1
//! capture thread N --+                        +--> ...
//! ```
//!
//! Each worker flushes its private batch when it reaches `batch_size` or when
//! the flush timer fires with something pending. A full queue blocks the
//! submitting thread; nothing is dropped while the pipeline is running.
//!
//! Shutdown: every [`Ingestor`] clone must be dropped first (the capture
//! threads stop), then [`IngestPipeline::shutdown`] closes the input side,
//! each worker drains the queue, flushes once and exits.

pub mod worker;

use crate::flow::FlowSnapshot;
use crate::store::{FlowSink, StoreError};
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot open flow sink: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn ingest worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Bounded queue capacity shared by all workers.
    pub queue_capacity: usize,
    /// Flush once a worker holds this many snapshots.
    pub batch_size: usize,
    /// Flush whatever is pending at this interval.
    pub flush_interval: Duration,
    /// Number of batch workers (0 = one per CPU).
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            queue_capacity: 1000,
            batch_size: 10,
            flush_interval: Duration::from_millis(500),
            workers: 0,
        }
    }
}

/// Shared pipeline counters.
#[derive(Debug, Default)]
pub struct IngestCounters {
    enqueued: AtomicU64,
    backpressure_waits: AtomicU64,
    dropped_after_close: AtomicU64,
    batches_flushed: AtomicU64,
    batches_failed: AtomicU64,
    rows_written: AtomicU64,
}

impl IngestCounters {
    pub fn snapshot(&self) -> IngestStats {
        IngestStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            dropped_after_close: self.dropped_after_close.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub enqueued: u64,
    pub backpressure_waits: u64,
    pub dropped_after_close: u64,
    pub batches_flushed: u64,
    pub batches_failed: u64,
    /// Rows the sinks inserted or updated, after in-batch coalescing.
    pub rows_written: u64,
}

/// Producer side of the queue. Cheap to clone, one per capture thread.
#[derive(Clone)]
pub struct Ingestor {
    tx: Sender<FlowSnapshot>,
    counters: Arc<IngestCounters>,
}

impl Ingestor {
    /// Enqueue a snapshot, blocking while the queue is full.
    ///
    /// Never fails: if every worker is gone the snapshot is counted as
    /// dropped and discarded.
    pub fn submit(&self, snapshot: FlowSnapshot) {
        let snapshot = match self.tx.try_send(snapshot) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(TrySendError::Full(snapshot)) => snapshot,
            Err(TrySendError::Disconnected(snapshot)) => {
                self.dropped(&snapshot);
                return;
            }
        };

        self.counters
            .backpressure_waits
            .fetch_add(1, Ordering::Relaxed);
        debug!(flow = %snapshot.flow_id, "ingest queue full, waiting");
        match self.tx.send(snapshot) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.dropped(&err.0),
        }
    }

    fn dropped(&self, snapshot: &FlowSnapshot) {
        self.counters
            .dropped_after_close
            .fetch_add(1, Ordering::Relaxed);
        trace!(flow = %snapshot.flow_id, "ingest queue closed, snapshot dropped");
    }
}

/// Handle to the running worker pool.
pub struct IngestPipeline {
    ingestor: Ingestor,
    workers: Vec<thread::JoinHandle<()>>,
    counters: Arc<IngestCounters>,
}

impl IngestPipeline {
    pub fn ingestor(&self) -> Ingestor {
        self.ingestor.clone()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> IngestStats {
        self.counters.snapshot()
    }

    /// Close the input side, wait for every worker to drain and flush, and
    /// return the final counters.
    ///
    /// Blocks until all outstanding [`Ingestor`] clones are dropped.
    pub fn shutdown(self) -> IngestStats {
        let IngestPipeline {
            ingestor,
            workers,
            counters,
        } = self;
        drop(ingestor);
        for handle in workers {
            if handle.join().is_err() {
                error!("ingest worker panicked");
            }
        }
        counters.snapshot()
    }
}

/// Open one sink per worker and start the pool.
///
/// `make_sink` is called with the worker index before any thread starts, so
/// a sink that cannot be opened fails the whole pipeline up front.
pub fn spawn<S, F>(config: &IngestConfig, mut make_sink: F) -> Result<IngestPipeline, PipelineError>
where
    S: FlowSink + 'static,
    F: FnMut(usize) -> Result<S, StoreError>,
{
    let num_workers = if config.workers == 0 {
        num_cpus::get()
    } else {
        config.workers
    };

    let sinks = (0..num_workers)
        .map(&mut make_sink)
        .collect::<Result<Vec<S>, StoreError>>()?;

    info!(
        workers = num_workers,
        queue_capacity = config.queue_capacity,
        batch_size = config.batch_size,
        flush_ms = config.flush_interval.as_millis() as u64,
        "starting ingest pipeline"
    );

    let (tx, rx) = bounded::<FlowSnapshot>(config.queue_capacity);
    let counters = Arc::new(IngestCounters::default());

    let mut workers = Vec::with_capacity(num_workers);
    for (id, sink) in sinks.into_iter().enumerate() {
        let w = worker::BatchWorker::new(
            id,
            sink,
            config.batch_size,
            config.flush_interval,
            counters.clone(),
        );
        let rx = rx.clone();
        let handle = thread::Builder::new()
            .name(format!("fm-ingest-{}", id))
            .spawn(move || w.run(rx))?;
        workers.push(handle);
    }

    Ok(IngestPipeline {
        ingestor: Ingestor {
            tx,
            counters: counters.clone(),
        },
        workers,
        counters,
    })
}
