//! Bulk sink abstraction and the Kinesis Data Firehose implementation.

use crate::config::FirehoseConfig;
use crate::record::PendingRecord;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_firehose::config::Builder as FirehoseConfigBuilder;
use aws_sdk_firehose::error::DisplayErrorContext;
use aws_sdk_firehose::primitives::Blob;
use aws_sdk_firehose::types::Record;
use aws_sdk_firehose::Client as FirehoseClient;
use std::ops::Range;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// PutRecordBatch accepts at most this many records per call
pub const MAX_RECORDS_PER_REQUEST: usize = 500;

/// PutRecordBatch accepts at most this many payload bytes per call
pub const MAX_BYTES_PER_REQUEST: usize = 4 * 1024 * 1024;

/// Largest single record Firehose accepts, before base64 encoding
pub const MAX_RECORD_BYTES: usize = 1000 * 1024;

/// Errors returned by a bulk write. All of them are retriable.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Bulk write failed: {0}")]
    Request(String),

    #[error("Bulk write timed out after {0:?}")]
    Timeout(Duration),

    /// The sink accepted the batch but rejected some records in it.
    /// `failed` holds indices into the submitted batch.
    #[error("{} of {total} records rejected by the sink", .failed.len())]
    PartialFailure { failed: Vec<usize>, total: usize },
}

impl SinkError {
    /// Records of `batch` that were not delivered and must be written again
    pub fn undelivered(&self, batch: Vec<PendingRecord>) -> Vec<PendingRecord> {
        match self {
            SinkError::PartialFailure { failed, .. } => batch
                .into_iter()
                .enumerate()
                .filter(|(index, _)| failed.contains(index))
                .map(|(_, record)| record)
                .collect(),
            SinkError::Request(_) | SinkError::Timeout(_) => batch,
        }
    }
}

/// Downstream service accepting records in bulk
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Write all `records` as one batch
    async fn put_batch(&self, records: &[PendingRecord]) -> Result<(), SinkError>;
}

/// Kinesis Data Firehose delivery stream writer
pub struct FirehoseSink {
    client: FirehoseClient,
    stream_name: String,
    request_timeout: Duration,
}

impl FirehoseSink {
    /// Create a new Firehose sink
    pub async fn new(config: &FirehoseConfig) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut firehose_config_builder = FirehoseConfigBuilder::from(&aws_config);

        // Configure custom endpoint for LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            firehose_config_builder = firehose_config_builder.endpoint_url(endpoint_url);
        }

        let client = FirehoseClient::from_conf(firehose_config_builder.build());

        info!(
            stream_name = %config.stream_name,
            region = %config.region,
            "Firehose sink initialized"
        );

        Ok(Self {
            client,
            stream_name: config.stream_name.clone(),
            request_timeout: config.request_timeout(),
        })
    }

    /// Send one PutRecordBatch request, returning indices of rejected records
    async fn put_chunk(&self, chunk: &[PendingRecord]) -> Result<Vec<usize>, SinkError> {
        let entries = chunk
            .iter()
            .map(|record| {
                Record::builder()
                    .data(Blob::new(record.as_bytes().to_vec()))
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SinkError::Request(e.to_string()))?;

        let request = self
            .client
            .put_record_batch()
            .delivery_stream_name(&self.stream_name)
            .set_records(Some(entries))
            .send();

        let output = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| SinkError::Timeout(self.request_timeout))?
            .map_err(|e| SinkError::Request(DisplayErrorContext(&e).to_string()))?;

        if output.failed_put_count() == 0 {
            return Ok(Vec::new());
        }

        let rejected = output
            .request_responses()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.error_code().is_some())
            .map(|(index, _)| index)
            .collect();

        Ok(rejected)
    }
}

#[async_trait]
impl BulkSink for FirehoseSink {
    #[instrument(skip(self, records), fields(stream = %self.stream_name, count = records.len()))]
    async fn put_batch(&self, records: &[PendingRecord]) -> Result<(), SinkError> {
        let mut outcomes = Vec::new();
        for range in request_chunks(records) {
            let outcome = self.put_chunk(&records[range.clone()]).await;
            outcomes.push((range, outcome));
        }

        let result = merge_chunk_outcomes(records.len(), outcomes);
        if result.is_ok() {
            debug!("Batch delivered to Firehose");
        }
        result
    }
}

/// Fold per-request outcomes into one result for the whole batch.
///
/// Rejected indices are relative to their request and get shifted back into
/// batch positions. When no record got through and a request failed outright,
/// that error is returned as is; any other mix is a `PartialFailure`.
pub fn merge_chunk_outcomes<I>(total: usize, outcomes: I) -> Result<(), SinkError>
where
    I: IntoIterator<Item = (Range<usize>, Result<Vec<usize>, SinkError>)>,
{
    let mut failed = Vec::new();
    let mut last_error = None;

    for (range, outcome) in outcomes {
        match outcome {
            Ok(rejected) => {
                if !rejected.is_empty() {
                    warn!(rejected = rejected.len(), "Firehose rejected records");
                }
                failed.extend(rejected.into_iter().map(|index| range.start + index));
            }
            Err(e) => {
                warn!(error = %e, records = range.len(), "PutRecordBatch request failed");
                failed.extend(range);
                last_error = Some(e);
            }
        }
    }

    if failed.is_empty() {
        return Ok(());
    }

    if failed.len() == total {
        if let Some(e) = last_error {
            return Err(e);
        }
    }

    Err(SinkError::PartialFailure { failed, total })
}

/// Split a batch into request-sized ranges honoring the record and byte limits
pub fn request_chunks(records: &[PendingRecord]) -> Vec<Range<usize>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut bytes = 0;

    for (index, record) in records.iter().enumerate() {
        let count = index - start;
        if count > 0
            && (count == MAX_RECORDS_PER_REQUEST || bytes + record.len() > MAX_BYTES_PER_REQUEST)
        {
            chunks.push(start..index);
            start = index;
            bytes = 0;
        }
        bytes += record.len();
    }

    if start < records.len() {
        chunks.push(start..records.len());
    }

    chunks
}
