use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DownstreamConfig, ForwardConfig};
use crate::generation::{Generation, GenerationManager};
use crate::metrics::PipelineMetrics;
use crate::pulse::key::CounterKey;
use crate::pulse::Pulse;
use crate::store::CounterStore;

/// Drains frozen generations and ships the aggregated counters downstream.
///
/// Each flush cycle toggles the generation label, waits a stabilization
/// delay so increments already in flight with the old label land, scans the
/// frozen half of the keyspace, and POSTs the aggregate in bounded-size
/// batches with bounded concurrency. Keys are deleted only after the
/// downstream acknowledges the batch; a failed batch stays in the KV and is
/// re-sent when its generation is drained again.
pub struct Forwarder {
    store: Arc<dyn CounterStore>,
    generation: Arc<GenerationManager>,
    metrics: Arc<PipelineMetrics>,
    client: reqwest::Client,
    url: String,
    batch_size: usize,
    max_in_flight: usize,
    scan_count: usize,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("url", &self.url)
            .field("batch_size", &self.batch_size)
            .field("max_in_flight", &self.max_in_flight)
            .field("scan_count", &self.scan_count)
            .finish()
    }
}

impl Forwarder {
    /// Fails on a non-positive batch size or in-flight bound, a missing
    /// downstream URL, or an unbuildable HTTP client; all of these abort
    /// service startup.
    pub fn new(
        store: Arc<dyn CounterStore>,
        generation: Arc<GenerationManager>,
        metrics: Arc<PipelineMetrics>,
        forward: &ForwardConfig,
        downstream: &DownstreamConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if forward.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if forward.max_in_flight == 0 {
            bail!("max_in_flight must be positive");
        }
        if downstream.url.is_empty() {
            bail!("downstream url is required");
        }

        let client = reqwest::Client::builder()
            .timeout(downstream.request_timeout)
            .pool_max_idle_per_host(downstream.pool_max_idle_per_host)
            .pool_idle_timeout(downstream.pool_idle_timeout)
            .build()
            .context("building downstream HTTP client")?;

        Ok(Self {
            store,
            generation,
            metrics,
            client,
            url: downstream.url.clone(),
            batch_size: forward.batch_size,
            max_in_flight: forward.max_in_flight,
            scan_count: forward.scan_count,
            cancel,
        })
    }

    /// Arms the periodic flush driver. The first cycle fires one full
    /// interval after start; the task exits on lifecycle cancellation,
    /// finishing any cycle already in flight.
    pub fn spawn_loop(
        self: Arc<Self>,
        interval: Duration,
        stabilization_delay: Duration,
    ) -> JoinHandle<()> {
        let forwarder = self;

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = forwarder.cancel.cancelled() => {
                        debug!("forward loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        info!("processing and sending aggregated pulses");
                        match forwarder.flush(stabilization_delay).await {
                            Ok(()) => info!("aggregated pulses sent"),
                            Err(e) => error!(error = %format!("{e:#}"), "flush cycle failed"),
                        }
                    }
                }
            }
        })
    }

    /// Runs one flush cycle. Per-key decode failures are logged and skipped;
    /// per-batch delivery failures are collected into one summary error.
    pub async fn flush(&self, stabilization_delay: Duration) -> Result<()> {
        let started = Instant::now();
        let result = self.run_cycle(stabilization_delay).await;
        self.metrics
            .aggregation_cycle_duration
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn run_cycle(&self, stabilization_delay: Duration) -> Result<()> {
        let drain_generation = self
            .generation
            .get_current()
            .await
            .context("reading current generation")?;

        // Writers that load the label after this point target the new
        // generation; the delay below lets those that loaded it before
        // finish their increments on the one being drained.
        self.generation
            .toggle()
            .await
            .context("toggling generation")?;

        tokio::time::sleep(stabilization_delay).await;

        let aggregated = self.collect(drain_generation).await?;
        if aggregated.is_empty() {
            info!(generation = %drain_generation, "no pulses to send");
            return Ok(());
        }

        let batches: Vec<Vec<(String, Pulse)>> = aggregated
            .chunks(self.batch_size)
            .map(<[(String, Pulse)]>::to_vec)
            .collect();
        let total = batches.len();

        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight = JoinSet::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let client = self.client.clone();
            let url = self.url.clone();
            let store = Arc::clone(&self.store);
            let metrics = Arc::clone(&self.metrics);

            in_flight.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => bail!("batch {index}: semaphore closed: {e}"),
                };
                send_batch(&client, &url, &*store, &metrics, drain_generation, index, batch).await
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(format!("{e:#}")),
                Err(e) => failures.push(format!("batch task join failed: {e}")),
            }
        }

        if !failures.is_empty() {
            bail!(
                "{} of {total} batches failed: {}",
                failures.len(),
                failures.join("; "),
            );
        }

        info!(
            generation = %drain_generation,
            batches = total,
            "generation drained",
        );
        Ok(())
    }

    /// Scans every counter of `drain_generation` into memory. Each key
    /// appears at most once per scan, so the map deduplicates naturally.
    async fn collect(&self, drain_generation: Generation) -> Result<Vec<(String, Pulse)>> {
        let pattern = CounterKey::scan_pattern(drain_generation);
        let mut cursor = 0u64;
        let mut aggregated: HashMap<String, Pulse> = HashMap::new();

        loop {
            let (keys, next_cursor) = self
                .store
                .scan(&pattern, cursor, self.scan_count)
                .await
                .context("scanning counter keys")?;
            cursor = next_cursor;

            for key in keys {
                let raw = match self.store.get(&key).await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => {
                        debug!(key = %key, "key vanished mid-scan");
                        continue;
                    }
                    Err(e) => {
                        error!(key = %key, error = %e, "failed to read counter");
                        continue;
                    }
                };

                let used_amount = match raw.parse::<f64>() {
                    Ok(v) if v.is_finite() => v,
                    _ => {
                        error!(key = %key, value = %raw, "counter value is not a finite number");
                        continue;
                    }
                };

                let parsed = match CounterKey::parse(&key) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(key = %key, error = %e, "skipping malformed counter key");
                        continue;
                    }
                };

                aggregated.insert(key, parsed.into_pulse(used_amount));
            }

            if cursor == 0 {
                break;
            }
        }

        Ok(aggregated.into_iter().collect())
    }
}

/// Delivers one batch and reclaims its keys.
///
/// Any of serialization failure, transport failure, or a non-200 status
/// fails the whole batch and leaves its keys in the KV. A delete failure
/// after delivery is also a batch error: the keys re-aggregate on the next
/// drain of this generation and the batch is re-sent.
async fn send_batch(
    client: &reqwest::Client,
    url: &str,
    store: &dyn CounterStore,
    metrics: &PipelineMetrics,
    generation: Generation,
    index: usize,
    batch: Vec<(String, Pulse)>,
) -> Result<()> {
    let count = batch.len() as f64;
    let pulses: Vec<&Pulse> = batch.iter().map(|(_, pulse)| pulse).collect();

    let body = match serde_json::to_vec(&pulses) {
        Ok(body) => body,
        Err(e) => {
            metrics.batch_parse_failed.inc_by(count);
            error!(batch = index, generation = %generation, error = %e, "failed to serialize batch");
            return Err(anyhow::Error::new(e).context(format!("batch {index}: serializing pulses")));
        }
    };

    let response = match client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            metrics.sent_failed.inc_by(count);
            error!(batch = index, generation = %generation, error = %e, "failed to send batch");
            return Err(anyhow::Error::new(e).context(format!("batch {index}: sending pulses")));
        }
    };

    let status = response.status();
    // Drain the body so the connection returns to the pool.
    let _ = response.bytes().await;

    if status != StatusCode::OK {
        metrics.sent_failed.inc_by(count);
        error!(batch = index, generation = %generation, status = %status, "downstream rejected batch");
        bail!("batch {index}: unexpected downstream status {status}");
    }

    let keys: Vec<String> = batch.into_iter().map(|(key, _)| key).collect();
    if let Err(e) = store.del(&keys).await {
        metrics.not_deleted.inc_by(count);
        error!(batch = index, generation = %generation, error = %e, "failed to delete delivered keys");
        return Err(
            anyhow::Error::new(e).context(format!("batch {index}: deleting delivered keys"))
        );
    }

    metrics.sent_success.inc_by(count);
    debug!(batch = index, pulses = keys.len(), "batch delivered");
    Ok(())
}
