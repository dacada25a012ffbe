use anyhow::Result;
use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Opts, Registry};

/// Prometheus metrics for the metering pipeline.
///
/// All metrics use the "ingestor" namespace and hang off a dedicated
/// registry that is injected into the components and served by the ingress
/// server, so tests can assert on isolated instances.
pub struct PipelineMetrics {
    registry: Registry,

    /// Pulses successfully stored in the counter store.
    pub pulses_received: Counter,
    /// Pulses taken off the queue, whether or not storing succeeded.
    pub pulses_processed: Counter,
    /// Per-pulse processing latency.
    pub pulse_processing_duration: Histogram,
    /// KV commands issued on the ingest path, including retries.
    pub redis_access: Counter,
    /// Current depth of the in-process pulse queue.
    pub channel_buffer_size: Gauge,
    /// Pulses lost to batch serialization failures.
    pub batch_parse_failed: Counter,
    /// Pulses in batches that failed to reach the downstream API.
    pub sent_failed: Counter,
    /// Pulses delivered and acknowledged downstream.
    pub sent_success: Counter,
    /// Delivered pulses whose counter keys could not be reclaimed.
    pub not_deleted: Counter,
    /// Wall time of one full flush cycle.
    pub aggregation_cycle_duration: Histogram,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let pulses_received = Counter::with_opts(
            Opts::new(
                "pulses_received_total",
                "Total pulses successfully stored by the ingestor.",
            )
            .namespace("ingestor"),
        )?;
        let pulses_processed = Counter::with_opts(
            Opts::new(
                "pulses_processed_total",
                "Total pulses processed by the ingestor, including store failures.",
            )
            .namespace("ingestor"),
        )?;
        let pulse_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pulse_processing_duration_seconds",
                "Time to apply one pulse to the counter store.",
            )
            .namespace("ingestor")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )?;
        let redis_access = Counter::with_opts(
            Opts::new(
                "redis_access_total",
                "Total KV commands issued while storing pulses.",
            )
            .namespace("ingestor"),
        )?;
        let channel_buffer_size = Gauge::with_opts(
            Opts::new(
                "channel_buffer_size",
                "Current number of pulses in the ingest queue.",
            )
            .namespace("ingestor"),
        )?;
        let batch_parse_failed = Counter::with_opts(
            Opts::new(
                "pulses_batch_parse_failed_total",
                "Total pulses lost to batch serialization failures.",
            )
            .namespace("ingestor"),
        )?;
        let sent_failed = Counter::with_opts(
            Opts::new(
                "pulses_sent_failed_total",
                "Total pulses in batches that failed to send downstream.",
            )
            .namespace("ingestor"),
        )?;
        let sent_success = Counter::with_opts(
            Opts::new(
                "pulses_sent_success_total",
                "Total pulses delivered and acknowledged downstream.",
            )
            .namespace("ingestor"),
        )?;
        let not_deleted = Counter::with_opts(
            Opts::new(
                "pulses_not_deleted_total",
                "Total delivered pulses whose counter keys were not reclaimed.",
            )
            .namespace("ingestor"),
        )?;
        let aggregation_cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "aggregation_cycle_duration_seconds",
                "Duration of one aggregation and forwarding cycle.",
            )
            .namespace("ingestor")
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        registry.register(Box::new(pulses_received.clone()))?;
        registry.register(Box::new(pulses_processed.clone()))?;
        registry.register(Box::new(pulse_processing_duration.clone()))?;
        registry.register(Box::new(redis_access.clone()))?;
        registry.register(Box::new(channel_buffer_size.clone()))?;
        registry.register(Box::new(batch_parse_failed.clone()))?;
        registry.register(Box::new(sent_failed.clone()))?;
        registry.register(Box::new(sent_success.clone()))?;
        registry.register(Box::new(not_deleted.clone()))?;
        registry.register(Box::new(aggregation_cycle_duration.clone()))?;

        Ok(Self {
            registry,
            pulses_received,
            pulses_processed,
            pulse_processing_duration,
            redis_access,
            channel_buffer_size,
            batch_parse_failed,
            sent_failed,
            sent_success,
            not_deleted,
            aggregation_cycle_duration,
        })
    }

    /// The registry backing the /metrics endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
