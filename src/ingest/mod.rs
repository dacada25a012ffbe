use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::generation::GenerationManager;
use crate::metrics::PipelineMetrics;
use crate::pulse::key::CounterKey;
use crate::pulse::Pulse;
use crate::store::{retry, CounterStore, StoreError};

/// KV attempts per pulse before it is logged and dropped.
const STORE_ATTEMPTS: usize = 3;

/// Accepts pulses from the ingress surface and applies them to the counter
/// store under the currently active generation.
///
/// The queue is a bounded MPMC channel drained by a pool of worker tasks.
/// Enqueue blocks when the queue is full until capacity frees, the lifecycle
/// token cancels, or the queue is closed; the latter two drop the pulse
/// silently. Ingress clients never observe backpressure as an error.
pub struct Ingestor {
    tx: parking_lot::Mutex<Option<flume::Sender<Pulse>>>,
    rx: flume::Receiver<Pulse>,
    store: Arc<dyn CounterStore>,
    generation: Arc<GenerationManager>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn CounterStore>,
        generation: Arc<GenerationManager>,
        metrics: Arc<PipelineMetrics>,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = flume::bounded(queue_capacity);

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx,
            store,
            generation,
            metrics,
            cancel,
            workers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Spawns `workers` long-running tasks draining the queue. A second call
    /// while workers are running is a no-op.
    pub fn start(&self, workers: usize) {
        let mut handles = self.workers.lock();
        if !handles.is_empty() {
            warn!("ingestor already started");
            return;
        }

        for id in 0..workers {
            let rx = self.rx.clone();
            let store = Arc::clone(&self.store);
            let generation = Arc::clone(&self.generation);
            let metrics = Arc::clone(&self.metrics);

            handles.push(tokio::spawn(async move {
                run_worker(id, rx, store, generation, metrics).await;
            }));
        }

        info!(workers, "ingest workers started");
    }

    /// Non-erroring submit. Waits for queue capacity; drops the pulse
    /// silently if the lifecycle has been cancelled or the queue closed.
    pub async fn enqueue(&self, pulse: Pulse) {
        let Some(tx) = self.tx.lock().clone() else {
            return;
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = tx.send_async(pulse) => {
                if result.is_ok() {
                    self.metrics.channel_buffer_size.set(self.rx.len() as f64);
                }
            }
        }
    }

    /// Closes the queue to new work and waits for the workers to drain the
    /// remaining items and exit.
    pub async fn stop(&self) {
        self.tx.lock().take();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "ingest worker join failed");
            }
        }

        info!("all ingest workers finished");
    }

    /// Current queue depth.
    pub fn queue_len(&self) -> usize {
        self.rx.len()
    }
}

/// Drains the queue until it is closed and empty.
async fn run_worker(
    id: usize,
    rx: flume::Receiver<Pulse>,
    store: Arc<dyn CounterStore>,
    generation: Arc<GenerationManager>,
    metrics: Arc<PipelineMetrics>,
) {
    while let Ok(pulse) = rx.recv_async().await {
        let started = Instant::now();

        match store_pulse(&*store, &generation, &metrics, &pulse).await {
            Ok(()) => metrics.pulses_received.inc(),
            Err(e) => {
                error!(
                    error = %e,
                    tenant_id = %pulse.tenant_id,
                    "failed to record pulse, dropping",
                );
            }
        }

        metrics
            .pulse_processing_duration
            .observe(started.elapsed().as_secs_f64());
        metrics.channel_buffer_size.set(rx.len() as f64);
        metrics.pulses_processed.inc();
    }

    debug!(worker = id, "ingest worker drained");
}

/// Applies one pulse to its counter, bounded at [`STORE_ATTEMPTS`] KV calls.
///
/// The generation label is re-read on every attempt so a retry that straddles
/// a toggle lands in the generation that is actually current.
async fn store_pulse(
    store: &dyn CounterStore,
    generation: &GenerationManager,
    metrics: &PipelineMetrics,
    pulse: &Pulse,
) -> Result<(), StoreError> {
    retry(STORE_ATTEMPTS, || async move {
        let key = CounterKey::for_pulse(generation.current(), pulse);
        metrics.redis_access.inc();
        store.incr_by_float(&key.to_string(), pulse.used_amount).await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulse::PulseUnit;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        metrics: Arc<PipelineMetrics>,
        cancel: CancellationToken,
        ingestor: Ingestor,
    }

    fn fixture(queue_capacity: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let generation = Arc::new(GenerationManager::new(
            Arc::clone(&store) as Arc<dyn CounterStore>
        ));
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let cancel = CancellationToken::new();
        let ingestor = Ingestor::new(
            Arc::clone(&store) as Arc<dyn CounterStore>,
            generation,
            Arc::clone(&metrics),
            queue_capacity,
            cancel.clone(),
        );
        Fixture {
            store,
            metrics,
            cancel,
            ingestor,
        }
    }

    fn pulse(tenant: &str, sku: &str, amount: f64) -> Pulse {
        Pulse::new(tenant, sku, amount, PulseUnit::Kb).unwrap()
    }

    #[tokio::test]
    async fn test_workers_aggregate_by_counter_key() {
        let f = fixture(128);
        f.ingestor.start(4);

        f.ingestor.enqueue(pulse("t1", "sku1", 10.0)).await;
        f.ingestor.enqueue(pulse("t1", "sku1", 15.0)).await;
        f.ingestor.enqueue(pulse("t2", "sku1", 7.0)).await;
        f.ingestor.stop().await;

        let total = f
            .store
            .get("generation:A:tenant:t1:sku:sku1:useUnit:KB")
            .await
            .unwrap()
            .unwrap();
        assert!((total.parse::<f64>().unwrap() - 25.0).abs() < 1e-9);

        let other = f
            .store
            .get("generation:A:tenant:t2:sku:sku1:useUnit:KB")
            .await
            .unwrap()
            .unwrap();
        assert!((other.parse::<f64>().unwrap() - 7.0).abs() < 1e-9);

        assert_eq!(f.metrics.pulses_received.get() as u64, 3);
        assert_eq!(f.metrics.pulses_processed.get() as u64, 3);
    }

    #[tokio::test]
    async fn test_stop_drains_pending_queue() {
        let f = fixture(256);
        f.ingestor.start(1);

        for i in 0..100 {
            f.ingestor.enqueue(pulse("t1", &format!("sku{i}"), 1.0)).await;
        }
        f.ingestor.stop().await;

        assert_eq!(f.ingestor.queue_len(), 0);
        assert_eq!(f.metrics.pulses_processed.get() as u64, 100);
        assert_eq!(f.store.dump().len(), 100);
    }

    #[tokio::test]
    async fn test_store_attempts_bounded_per_pulse() {
        let f = fixture(16);
        f.store.arm_failure("INCRBYFLOAT", STORE_ATTEMPTS);
        f.ingestor.start(1);

        f.ingestor.enqueue(pulse("t1", "sku1", 5.0)).await;
        f.ingestor.stop().await;

        assert_eq!(f.store.calls("INCRBYFLOAT"), STORE_ATTEMPTS);
        assert_eq!(f.metrics.pulses_received.get() as u64, 0);
        assert_eq!(f.metrics.pulses_processed.get() as u64, 1);
        assert!(!f.store.contains_key("generation:A:tenant:t1:sku:sku1:useUnit:KB"));
    }

    #[tokio::test]
    async fn test_store_recovers_within_attempt_bound() {
        let f = fixture(16);
        f.store.arm_failure("INCRBYFLOAT", 2);
        f.ingestor.start(1);

        f.ingestor.enqueue(pulse("t1", "sku1", 5.0)).await;
        f.ingestor.stop().await;

        assert_eq!(f.store.calls("INCRBYFLOAT"), 3);
        assert_eq!(f.metrics.pulses_received.get() as u64, 1);
        assert!(f.store.contains_key("generation:A:tenant:t1:sku:sku1:useUnit:KB"));
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_is_noop() {
        let f = fixture(16);
        f.ingestor.start(1);
        f.ingestor.stop().await;

        f.ingestor.enqueue(pulse("t1", "sku1", 5.0)).await;

        assert_eq!(f.metrics.pulses_processed.get() as u64, 0);
        assert!(f.store.dump().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_on_cancelled_lifecycle_drops() {
        let f = fixture(1);
        // No workers: the queue fills and stays full.
        f.ingestor.enqueue(pulse("t1", "sku1", 1.0)).await;
        f.cancel.cancel();

        // Must return promptly instead of blocking on the full queue.
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            f.ingestor.enqueue(pulse("t2", "sku1", 1.0)),
        )
        .await
        .expect("enqueue on cancelled lifecycle should not block");

        assert_eq!(f.ingestor.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_spawns_once() {
        let f = fixture(16);
        f.ingestor.start(2);
        f.ingestor.start(2);
        assert_eq!(f.ingestor.workers.lock().len(), 2);
        f.ingestor.stop().await;
    }
}
