use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the trips service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Telemetry search index configuration
    pub elasticsearch: ElasticsearchConfig,
    /// Archive network configuration
    pub archive: ArchiveConfig,
    /// Worker pool and pipeline switches
    #[serde(default)]
    pub consumer: ConsumerConfig,
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

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying trip segment lifecycle events
    #[serde(default = "default_segment_topic")]
    pub segment_topic: String,
    /// Topic carrying vehicle identity (mint) events
    #[serde(default = "default_vehicle_topic")]
    pub vehicle_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// How range bounds are rendered in telemetry queries.
///
/// Older index generations store `data.timestamp` as an ISO-8601 string,
/// newer ones as epoch milliseconds.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    #[default]
    Rfc3339,
    EpochMillis,
}

/// Telemetry search index configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ElasticsearchConfig {
    /// Base URL of the search cluster
    pub url: String,
    /// Basic auth username
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    /// Index holding raw device telemetry
    pub index: String,
    /// Records requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Encoding of the range filter bounds
    #[serde(default)]
    pub timestamp_format: TimestampFormat,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Archive network configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Archive network node base URL
    pub url: String,
    /// Currency segment of the upload path (`{url}/tx/{currency}`)
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Base64-encoded 32-byte Ed25519 seed used to sign data items
    pub signer_private_key: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Number of concurrent segment workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Capacity of each in-process task queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Fetch and archive telemetry when a segment completes
    #[serde(default = "default_true")]
    pub data_fetch_enabled: bool,
    /// Send packaged items to the archive network
    #[serde(default = "default_true")]
    pub upload_enabled: bool,
    /// How long shutdown waits for in-flight tasks, in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "trips-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "trips-api".to_string()
}

fn default_segment_topic() -> String {
    "topic.device.segments".to_string()
}

fn default_vehicle_topic() -> String {
    "topic.event".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> usize {
    10000 // index max_result_window
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_currency() -> String {
    "arweave".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "trips-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/trips").required(false))
            .add_source(config::File::with_name("/etc/trips/trips").required(false))
            // Override with environment variables
            // TRIPS__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("TRIPS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall the pipeline
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.consumer.worker_count == 0 {
            anyhow::bail!("consumer.worker_count must be at least 1");
        }
        if self.consumer.queue_capacity == 0 {
            anyhow::bail!("consumer.queue_capacity must be at least 1");
        }
        if self.elasticsearch.page_size == 0 {
            anyhow::bail!("elasticsearch.page_size must be at least 1");
        }
        Ok(())
    }

    /// Get the shutdown drain timeout as Duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer.drain_timeout_secs)
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

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            data_fetch_enabled: true,
            upload_enabled: true,
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}
