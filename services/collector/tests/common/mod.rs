//! Shared fakes for collector integration tests

use async_trait::async_trait;
use collector_service::{BulkSink, PendingRecord, SinkError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How a [`RecordingSink`] answers `put_batch`
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail,
    /// Fail every other call, starting with the first
    Alternate,
}

/// Sink that keeps every delivered batch in memory
pub struct RecordingSink {
    behavior: Mutex<Behavior>,
    delivered: Mutex<Vec<Vec<PendingRecord>>>,
    calls: AtomicUsize,
    failures: AtomicUsize,
    delay: Option<Duration>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            delivered: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Hold every write for `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    /// Number of `put_batch` calls, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Batches that were accepted, as UTF-8 strings
    pub fn delivered(&self) -> Vec<Vec<String>> {
        self.delivered
            .lock()
            .iter()
            .map(|batch| payloads(batch))
            .collect()
    }

    /// Every accepted record, flattened
    pub fn delivered_records(&self) -> Vec<String> {
        self.delivered().into_iter().flatten().collect()
    }
}

#[async_trait]
impl BulkSink for RecordingSink {
    async fn put_batch(&self, records: &[PendingRecord]) -> Result<(), SinkError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail = match *self.behavior.lock() {
            Behavior::Succeed => false,
            Behavior::Fail => true,
            Behavior::Alternate => call % 2 == 0,
        };

        if fail {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(SinkError::Request("delivery stream unavailable".to_string()));
        }

        self.delivered.lock().push(records.to_vec());
        Ok(())
    }
}

#[allow(dead_code)]
pub fn record(payload: impl Into<String>) -> PendingRecord {
    let payload: String = payload.into();
    PendingRecord::try_from(payload).expect("non-empty payload")
}

pub fn payloads(records: &[PendingRecord]) -> Vec<String> {
    records
        .iter()
        .map(|r| String::from_utf8_lossy(r.as_bytes()).into_owned())
        .collect()
}
