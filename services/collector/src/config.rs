use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the collector service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP listener configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Firehose delivery stream configuration
    #[serde(default)]
    pub firehose: FirehoseConfig,
    /// Batching thresholds
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Kinesis Data Firehose configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FirehoseConfig {
    /// Delivery stream receiving the batches
    #[serde(default)]
    pub stream_name: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Timeout for a single PutRecordBatch call in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Flush thresholds for the in-memory batch buffer
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Flush once this many records are pending
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Flush once this many seconds passed since the last flush
    #[serde(default = "default_max_time_window_secs")]
    pub max_time_window_secs: u64,
    /// Optional interval for flushing on a timer instead of only on append
    pub background_flush_secs: Option<u64>,
}

// Default value functions
fn default_service_name() -> String {
    "collector-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_region() -> String {
    "ap-northeast-1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_batch_size() -> usize {
    200
}

fn default_max_time_window_secs() -> u64 {
    300 // 5 minutes
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            // Start with default values
            .set_default("service.name", "collector-service")?
            .set_default("service.log_level", "info")?;

        // Variables understood by earlier deployments act as defaults
        if let Ok(stream_name) = std::env::var("STREAM_NAME") {
            builder = builder.set_default("firehose.stream_name", stream_name)?;
        }
        if let Ok(batch_size) = std::env::var("BATCH_SIZE") {
            builder = builder.set_default("batch.max_batch_size", batch_size)?;
        }

        let config = builder
            // Add config file if present
            .add_source(config::File::with_name("config/collector").required(false))
            .add_source(config::File::with_name("/etc/collector/collector").required(false))
            // Override with environment variables
            // COLLECTOR__FIREHOSE__STREAM_NAME -> firehose.stream_name
            .add_source(
                config::Environment::with_prefix("COLLECTOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration, failing on values the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.firehose.stream_name.trim().is_empty() {
            return Err(ConfigError::MissingRequired(
                "firehose.stream_name".to_string(),
            ));
        }

        if self.firehose.region.trim().is_empty() {
            return Err(ConfigError::MissingRequired("firehose.region".to_string()));
        }

        if self.firehose.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "firehose.request_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.batch.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch.max_batch_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.batch.max_time_window_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch.max_time_window_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.batch.background_flush_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "batch.background_flush_secs".to_string(),
                message: "must be greater than zero when set".to_string(),
            });
        }

        Ok(())
    }

    /// Get the flush time window as Duration
    pub fn max_time_window(&self) -> Duration {
        Duration::from_secs(self.batch.max_time_window_secs)
    }

    /// Get the background flush interval, if enabled
    pub fn background_flush_interval(&self) -> Option<Duration> {
        self.batch.background_flush_secs.map(Duration::from_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl FirehoseConfig {
    /// Get the per-request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            region: default_region(),
            endpoint_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_time_window_secs: default_max_time_window_secs(),
            background_flush_secs: None,
        }
    }
}
