use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::ProducerConfig;
use crate::pulse::{Pulse, PulseUnit};

/// Synthetic load generator: simulates a fleet of tenants emitting random
/// pulses against the ingest endpoint. One task per tenant, each pausing a
/// random delay between pulses.
pub struct PulseProducer {
    cfg: ProducerConfig,
    client: reqwest::Client,
    /// SKU catalogue shared by all tenants; the unit is fixed per SKU so
    /// repeated pulses aggregate into the same counter.
    skus: Arc<Vec<(String, PulseUnit)>>,
    sent: Arc<AtomicU64>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PulseProducer {
    pub fn new(cfg: ProducerConfig) -> Result<Self> {
        cfg.validate()?;

        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("building producer HTTP client")?;

        let mut rng = StdRng::from_entropy();
        let skus = (0..cfg.skus)
            .map(|i| {
                let unit = PulseUnit::ALL[rng.gen_range(0..PulseUnit::ALL.len())];
                (format!("SKU-{i}"), unit)
            })
            .collect();

        Ok(Self {
            cfg,
            client,
            skus: Arc::new(skus),
            sent: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Spawns one emitting task per simulated tenant.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        for _ in 0..self.cfg.tenants {
            let cfg = self.cfg.clone();
            let client = self.client.clone();
            let skus = Arc::clone(&self.skus);
            let sent = Arc::clone(&self.sent);
            let cancel = self.cancel.clone();

            tasks.push(tokio::spawn(async move {
                run_tenant(cfg, client, skus, sent, cancel).await;
            }));
        }

        info!(tenants = self.cfg.tenants, url = %self.cfg.ingestor_url, "pulse producer started");
    }

    /// Stops all tenant tasks and reports the total sent.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        info!(total = self.sent.load(Ordering::Relaxed), "pulse producer stopped");
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

async fn run_tenant(
    cfg: ProducerConfig,
    client: reqwest::Client,
    skus: Arc<Vec<(String, PulseUnit)>>,
    sent: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let tenant_id = Uuid::new_v4().to_string();
    let mut rng = StdRng::from_entropy();
    let delay_range = cfg.min_delay..cfg.max_delay;

    loop {
        let delay = rng.gen_range(delay_range.clone());
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let (sku, unit) = &skus[rng.gen_range(0..skus.len())];
        let used_amount = f64::from(rng.gen_range(0..1000)) + rng.gen::<f64>();

        let pulse = match Pulse::new(tenant_id.clone(), sku.clone(), used_amount, *unit) {
            Ok(pulse) => pulse,
            Err(e) => {
                error!(error = %e, "failed to build pulse");
                continue;
            }
        };

        let response = match client.post(&cfg.ingestor_url).json(&pulse).send().await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "failed to send pulse");
                continue;
            }
        };

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            sent.fetch_add(1, Ordering::Relaxed);
            debug!(tenant_id = %tenant_id, sku = %sku, "pulse sent");
        } else {
            error!(status = %response.status(), "ingest endpoint rejected pulse");
        }
    }
}
