//! In-memory batching of enriched records in front of the bulk sink.
//!
//! Producers call [`BatchBuffer::append`] once per event. Most calls only push
//! the record and return. The call that crosses the count or time threshold
//! swaps the pending records out under the lock and writes them to the sink
//! after releasing it, so a slow sink never stalls the other producers.
//!
//! A failed write puts the undelivered records back into the live buffer.
//! They go out with the next flush; nothing retries on its own unless the
//! background flusher is enabled. Records still pending when the process
//! exits are lost.

use crate::record::PendingRecord;
use crate::sink::{BulkSink, SinkError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// When a buffer should hand its records to the sink
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    /// Flush once this many records are pending
    pub max_batch_size: usize,
    /// Flush once this much time passed since the last flush attempt
    pub max_time_window: Duration,
}

impl FlushPolicy {
    pub fn new(max_batch_size: usize, max_time_window: Duration) -> Self {
        Self {
            max_batch_size,
            max_time_window,
        }
    }

    fn should_flush(&self, pending: usize, elapsed: Duration) -> bool {
        pending >= self.max_batch_size || elapsed >= self.max_time_window
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::new(200, Duration::from_secs(5 * 60))
    }
}

struct BufferState {
    records: Vec<PendingRecord>,
    last_flush: Instant,
}

impl BufferState {
    /// Hand over everything pending and restart the flush clock
    fn take(&mut self) -> Vec<PendingRecord> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.records)
    }
}

/// Process-wide accumulator of records waiting for a bulk write
pub struct BatchBuffer {
    state: Mutex<BufferState>,
    sink: Arc<dyn BulkSink>,
    policy: FlushPolicy,
}

impl BatchBuffer {
    pub fn new(sink: Arc<dyn BulkSink>, policy: FlushPolicy) -> Self {
        Self {
            state: Mutex::new(BufferState {
                records: Vec::with_capacity(policy.max_batch_size),
                last_flush: Instant::now(),
            }),
            sink,
            policy,
        }
    }

    /// Add a record, flushing when a threshold is reached.
    ///
    /// Returns the sink error when this call triggered a flush that failed.
    /// The records of that batch stay buffered.
    pub async fn append(&self, record: PendingRecord) -> Result<(), SinkError> {
        metrics::counter!("collector.records.appended").increment(1);

        let batch = {
            let mut state = self.state.lock();
            state.records.push(record);

            if !self
                .policy
                .should_flush(state.records.len(), state.last_flush.elapsed())
            {
                metrics::gauge!("collector.buffer.pending").set(state.records.len() as f64);
                return Ok(());
            }

            state.take()
        };

        self.transmit(batch).await
    }

    /// Write out everything pending regardless of thresholds
    pub async fn flush(&self) -> Result<(), SinkError> {
        let batch = {
            let mut state = self.state.lock();
            if state.records.is_empty() {
                return Ok(());
            }
            state.take()
        };

        self.transmit(batch).await
    }

    /// Flush only if the time window expired with records pending.
    ///
    /// Returns whether a flush was attempted.
    pub async fn flush_if_due(&self) -> Result<bool, SinkError> {
        let batch = {
            let mut state = self.state.lock();
            if state.records.is_empty()
                || state.last_flush.elapsed() < self.policy.max_time_window
            {
                return Ok(false);
            }
            state.take()
        };

        self.transmit(batch).await.map(|()| true)
    }

    /// Number of records waiting for a flush
    pub fn pending(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Copy of the records waiting for a flush
    pub fn pending_records(&self) -> Vec<PendingRecord> {
        self.state.lock().records.clone()
    }

    /// Send a taken batch; on failure merge the undelivered records back
    #[instrument(skip(self, batch), fields(batch_size = batch.len()))]
    async fn transmit(&self, batch: Vec<PendingRecord>) -> Result<(), SinkError> {
        let batch_size = batch.len();
        let started = std::time::Instant::now();

        let result = self.sink.put_batch(&batch).await;

        metrics::histogram!("collector.flush.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::counter!("collector.flush.succeeded").increment(1);
                metrics::counter!("collector.records.delivered").increment(batch_size as u64);
                debug!("Batch flushed");
                Ok(())
            }
            Err(e) => {
                let undelivered = e.undelivered(batch);
                let requeued = undelivered.len();

                let pending = {
                    let mut state = self.state.lock();
                    state.records.extend(undelivered);
                    state.records.len()
                };

                metrics::counter!("collector.flush.failed").increment(1);
                metrics::counter!("collector.records.requeued").increment(requeued as u64);
                metrics::counter!("collector.records.delivered")
                    .increment((batch_size - requeued) as u64);
                metrics::gauge!("collector.buffer.pending").set(pending as f64);

                warn!(error = %e, requeued, pending, "Flush failed, records requeued");
                Err(e)
            }
        }
    }
}

/// Periodically flush a buffer whose time window expired, so pending records
/// do not wait for the next append on a quiet endpoint
pub fn spawn_background_flusher(buffer: Arc<BatchBuffer>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = every.as_secs(), "Background flusher started");

        loop {
            ticker.tick().await;
            if let Err(e) = buffer.flush_if_due().await {
                warn!(error = %e, "Background flush failed");
            }
        }
    })
}
