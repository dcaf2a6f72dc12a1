//! Batch worker: drains the shared snapshot queue into a private batch and
//! writes it to its own sink.

use crossbeam_channel::{select, tick, Receiver};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::IngestCounters;
use crate::flow::FlowSnapshot;
use crate::store::FlowSink;

pub struct BatchWorker<S: FlowSink> {
    id: usize,
    sink: S,
    batch: Vec<FlowSnapshot>,
    batch_size: usize,
    flush_interval: Duration,
    counters: Arc<IngestCounters>,
}

impl<S: FlowSink> BatchWorker<S> {
    pub fn new(
        id: usize,
        sink: S,
        batch_size: usize,
        flush_interval: Duration,
        counters: Arc<IngestCounters>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        BatchWorker {
            id,
            sink,
            batch: Vec::with_capacity(batch_size),
            batch_size,
            flush_interval,
            counters,
        }
    }

    /// Run until every sender is gone and the queue is empty, then flush the
    /// remainder once.
    pub fn run(mut self, rx: Receiver<FlowSnapshot>) {
        let ticker = tick(self.flush_interval);
        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(snapshot) => {
                        self.batch.push(snapshot);
                        if self.batch.len() >= self.batch_size {
                            self.flush();
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    if !self.batch.is_empty() {
                        self.flush();
                    }
                }
            }
        }

        self.flush();
        debug!(worker = self.id, "ingest worker shut down");
    }

    /// Write the pending batch. A failed batch is logged and discarded.
    fn flush(&mut self) {
        let snapshots = self.batch.len();
        if snapshots == 0 {
            return;
        }

        match self.sink.write_batch(&self.batch) {
            Ok(rows) => {
                self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .rows_written
                    .fetch_add(rows as u64, Ordering::Relaxed);
                debug!(worker = self.id, snapshots, rows, "batch flushed");
            }
            Err(e) => {
                self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                error!(worker = self.id, snapshots, error = %e, "batch write failed, dropping batch");
            }
        }
        self.batch.clear();
    }
}
