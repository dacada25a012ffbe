use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::forward::Forwarder;
use crate::generation::GenerationManager;
use crate::ingest::Ingestor;
use crate::metrics::PipelineMetrics;
use crate::server::IngressServer;
use crate::store::{CounterStore, RedisCounterStore};

/// Wires the pipeline together and owns its lifecycle: ingress server,
/// ingest worker pool, and the periodic flush driver, all fed from one
/// cancellation token.
pub struct Service {
    cfg: Config,
    generation: Arc<GenerationManager>,
    ingestor: Arc<Ingestor>,
    forwarder: Arc<Forwarder>,
    server: IngressServer,
    forward_task: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Service {
    /// Connects to the counter store and builds the pipeline. Any failure
    /// here (bad configuration, unreachable KV) aborts startup.
    pub async fn new(cfg: Config) -> Result<Self> {
        cfg.validate()?;

        let store = RedisCounterStore::connect(&cfg.redis)
            .await
            .context("connecting to counter store")?;

        let metrics = Arc::new(PipelineMetrics::new().context("registering metrics")?);

        Self::with_store(cfg, Arc::new(store), metrics)
    }

    /// Same wiring over an injected store and metrics, letting tests run the
    /// whole service against the in-memory adapter.
    pub fn with_store(
        cfg: Config,
        store: Arc<dyn CounterStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        cfg.validate()?;

        let cancel = CancellationToken::new();
        let generation = Arc::new(GenerationManager::new(Arc::clone(&store)));

        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&store),
            Arc::clone(&generation),
            Arc::clone(&metrics),
            cfg.ingest.queue_capacity,
            cancel.clone(),
        ));

        let forwarder = Arc::new(
            Forwarder::new(
                store,
                Arc::clone(&generation),
                Arc::clone(&metrics),
                &cfg.forward,
                &cfg.downstream,
                cancel.clone(),
            )
            .context("building forwarder")?,
        );

        let server = IngressServer::new(&cfg.listen, Arc::clone(&ingestor), metrics);

        Ok(Self {
            cfg,
            generation,
            ingestor,
            forwarder,
            server,
            forward_task: None,
            cancel,
        })
    }

    /// Synchronizes the generation label, starts the ingress server, the
    /// worker pool, and the flush driver. Returns the bound ingress address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        self.generation
            .load()
            .await
            .context("loading current generation")?;

        let addr = self
            .server
            .start()
            .await
            .context("starting ingress server")?;

        self.ingestor.start(self.cfg.ingest.workers);

        self.forward_task = Some(Arc::clone(&self.forwarder).spawn_loop(
            self.cfg.forward.flush_interval,
            self.cfg.forward.stabilization_delay,
        ));

        info!("pulsor service started");
        Ok(addr)
    }

    /// Graceful shutdown: stop accepting new pulses, close the queue and
    /// drain the workers, stop the flush driver, and wait for any in-flight
    /// cycle to finish.
    pub async fn stop(&mut self) -> Result<()> {
        self.server.stop().await;
        self.ingestor.stop().await;

        self.cancel.cancel();
        if let Some(task) = self.forward_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "forward loop join failed");
            }
        }

        info!("pulsor service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownstreamConfig, RedisConfig};
    use crate::store::{MemoryStore, CURRENT_GENERATION_KEY};

    fn config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                ..Default::default()
            },
            downstream: DownstreamConfig {
                url: "http://localhost:1/usage".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_fatal_at_construction() {
        let mut cfg = config();
        cfg.forward.batch_size = 0;

        let store = Arc::new(MemoryStore::new()) as Arc<dyn CounterStore>;
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        assert!(Service::with_store(cfg, store, metrics).is_err());
    }

    #[tokio::test]
    async fn test_start_seeds_generation_and_stop_is_clean() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let mut service = Service::with_store(
            config(),
            Arc::clone(&store) as Arc<dyn CounterStore>,
            metrics,
        )
        .unwrap();

        let addr = service.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(
            store.get(CURRENT_GENERATION_KEY).await.unwrap().as_deref(),
            Some("A")
        );

        service.stop().await.unwrap();
    }
}
