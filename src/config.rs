use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the pulsor service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Ingress listen address; ":8080" shorthand binds 0.0.0.0. Default: ":8080".
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Counter store connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Downstream accounting API configuration.
    #[serde(default)]
    pub downstream: DownstreamConfig,

    /// Ingest queue and worker pool configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Aggregation and forwarding configuration.
    #[serde(default)]
    pub forward: ForwardConfig,

    /// Synthetic load producer configuration (the `produce` subcommand).
    #[serde(default)]
    pub producer: ProducerConfig,
}

/// Counter store connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis URL (e.g., "redis://localhost:6379").
    #[serde(default)]
    pub url: String,

    /// Connection establishment timeout. Default: 5s.
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,

    /// Per-command timeout for reads (GET, SCAN). Default: 3s.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Per-command timeout for writes (INCRBYFLOAT, SET, DEL). Default: 3s.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
}

/// Downstream accounting API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamConfig {
    /// URL batches are POSTed to.
    #[serde(default)]
    pub url: String,

    /// End-to-end timeout for one batch POST. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Idle connections kept per downstream host. Default: 50.
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// How long idle connections are kept. Default: 30s.
    #[serde(default = "default_pool_idle_timeout", with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
}

/// Ingest queue and worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Number of worker tasks draining the queue. Default: 8.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bounded queue capacity; sized to absorb bursts at 10^4+ events/s.
    /// Default: 50000.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Aggregation and forwarding configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    /// Maximum pulses per downstream batch. Must be positive. Default: 100.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Interval between flush cycles. Default: 30s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Wait after the generation toggle before scanning, letting in-flight
    /// writers finish on the old generation. Default: 5s.
    #[serde(default = "default_stabilization_delay", with = "humantime_serde")]
    pub stabilization_delay: Duration,

    /// Maximum concurrent batch POSTs. Default: 5.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// COUNT hint for each SCAN page. Default: 100.
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
}

/// Synthetic load producer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    /// Ingest endpoint pulses are POSTed to.
    #[serde(default = "default_producer_url")]
    pub ingestor_url: String,

    /// Lower bound of the random inter-pulse delay. Default: 50ms.
    #[serde(default = "default_min_delay", with = "humantime_serde")]
    pub min_delay: Duration,

    /// Upper bound of the random inter-pulse delay. Default: 500ms.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Number of simulated tenants, one task each. Default: 10.
    #[serde(default = "default_tenants")]
    pub tenants: usize,

    /// Number of distinct SKUs across the simulated fleet. Default: 20.
    #[serde(default = "default_skus")]
    pub skus: usize,

    /// Producer HTTP request timeout. Default: 5s.
    #[serde(default = "default_producer_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    ":8080".to_string()
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_pool_max_idle_per_host() -> usize {
    50
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    50_000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_stabilization_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_in_flight() -> usize {
    5
}

fn default_scan_count() -> usize {
    100
}

fn default_producer_url() -> String {
    "http://localhost:8080/ingest".to_string()
}

fn default_min_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_tenants() -> usize {
    10
}

fn default_skus() -> usize {
    20
}

fn default_producer_timeout() -> Duration {
    Duration::from_secs(5)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen: default_listen(),
            redis: RedisConfig::default(),
            downstream: DownstreamConfig::default(),
            ingest: IngestConfig::default(),
            forward: ForwardConfig::default(),
            producer: ProducerConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            dial_timeout: default_dial_timeout(),
            read_timeout: default_command_timeout(),
            write_timeout: default_command_timeout(),
        }
    }
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout: default_pool_idle_timeout(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            stabilization_delay: default_stabilization_delay(),
            max_in_flight: default_max_in_flight(),
            scan_count: default_scan_count(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            ingestor_url: default_producer_url(),
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
            tenants: default_tenants(),
            skus: default_skus(),
            request_timeout: default_producer_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.redis.url.is_empty() {
            bail!("redis.url is required");
        }

        if self.downstream.url.is_empty() {
            bail!("downstream.url is required");
        }

        if self.forward.batch_size == 0 {
            bail!("forward.batch_size must be positive");
        }

        if self.forward.max_in_flight == 0 {
            bail!("forward.max_in_flight must be positive");
        }

        if self.ingest.workers == 0 {
            bail!("ingest.workers must be positive");
        }

        if self.ingest.queue_capacity == 0 {
            bail!("ingest.queue_capacity must be positive");
        }

        Ok(())
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ingestor_url.is_empty() {
            bail!("producer.ingestor_url is required");
        }
        if self.tenants == 0 {
            bail!("producer.tenants must be positive");
        }
        if self.skus == 0 {
            bail!("producer.skus must be positive");
        }
        if self.max_delay <= self.min_delay {
            bail!("producer.max_delay must be greater than producer.min_delay");
        }
        Ok(())
    }
}
