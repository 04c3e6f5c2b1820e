//! Collector Service
//!
//! Tracking endpoint that enriches one event per request and forwards the
//! events to a Kinesis Data Firehose delivery stream in batches.
//!
//! ## Features
//!
//! - **Pixel and JSON ingestion**: GET requests carry the event in the query
//!   string and receive a transparent GIF, POST requests carry a JSON object
//! - **Enrichment**: client and session identifiers backed by cookies, client
//!   address, browser, OS and device class parsed from the User-Agent, edge
//!   country and a UTC timestamp. Events too large for Firehose are refused
//! - **Batched delivery**: records are buffered in memory and written with one
//!   `PutRecordBatch` per flush, triggered by record count or elapsed time
//! - **Failure recovery**: records of a failed write go back into the buffer
//!   and are retried by the next flush
//!
//! ## Architecture
//!
//! ```text
//! HTTP request         Enricher            Batch Buffer          Firehose
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐     ┌──────────────┐
//! │ /api/pixel   │───▶│ ids, ip, ua, │───▶│ append       │────▶│ PutRecord    │
//! │ GET / POST   │    │ createdAt    │    │ (size/time)  │     │ Batch        │
//! └──────────────┘    └──────────────┘    └──────────────┘     └──────────────┘
//!                                                ▲                    │
//!                                                └──── requeue ───────┘
//!                                                      on failure
//! ```

pub mod api;
pub mod buffer;
pub mod config;
pub mod enricher;
pub mod record;
pub mod sink;

pub use api::{create_router, AppState};
pub use buffer::{spawn_background_flusher, BatchBuffer, FlushPolicy};
pub use config::{Config, ConfigError};
pub use enricher::{EnrichError, Enriched, Enricher, RawEvent, UserAgentInfo};
pub use record::{InvalidRecord, PendingRecord};
pub use sink::{BulkSink, FirehoseSink, SinkError, MAX_RECORD_BYTES};
