use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ingest::Ingestor;
use crate::metrics::PipelineMetrics;
use crate::pulse::{Pulse, PulseUnit};

/// HTTP ingress surface: accepts pulses, serves Prometheus metrics and a
/// health probe.
///
/// Ingress clients only ever observe 4xx for their own malformed input;
/// pipeline backpressure and store failures are invisible here because the
/// response is committed once the pulse is handed to the ingestor.
pub struct IngressServer {
    addr: String,
    state: AppState,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    serve_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
struct AppState {
    ingestor: Arc<Ingestor>,
    metrics: Arc<PipelineMetrics>,
}

impl IngressServer {
    pub fn new(addr: &str, ingestor: Arc<Ingestor>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            addr: addr.to_string(),
            state: AppState { ingestor, metrics },
            shutdown: parking_lot::Mutex::new(None),
            serve_task: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and starts serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        // Handle ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app = Router::new()
            .route("/ingest", post(ingest_handler))
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(self.state.clone());

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let task = tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "ingress server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "ingress server error");
            }
        });
        *self.serve_task.lock() = Some(task);

        Ok(local_addr)
    }

    /// Stops accepting connections and waits for the server task to finish.
    pub async fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        let task = self.serve_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "ingress server join failed");
            }
        }
    }
}

/// Wire schema of `POST /ingest`. The unit arrives as a raw string so that
/// an unknown unit can be distinguished from a structurally broken payload.
#[derive(Debug, Deserialize)]
struct IngestRequest {
    tenant_id: String,
    product_sku: String,
    used_amount: f64,
    use_unit: String,
}

fn bad_request(message: &'static str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// POST /ingest - validate and enqueue one pulse.
async fn ingest_handler(
    State(state): State<AppState>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            debug!(error = %rejection, "rejecting malformed ingest payload");
            return bad_request("Invalid request");
        }
    };

    let use_unit = match request.use_unit.parse::<PulseUnit>() {
        Ok(unit) => unit,
        Err(_) => {
            debug!(unit = %request.use_unit, "rejecting unknown pulse unit");
            return bad_request("Invalid pulse unit");
        }
    };

    let pulse = match Pulse::new(
        request.tenant_id,
        request.product_sku,
        request.used_amount,
        use_unit,
    ) {
        Ok(pulse) => pulse,
        Err(e) => {
            debug!(error = %e, "rejecting invalid pulse");
            return bad_request("Invalid request");
        }
    };

    state.ingestor.enqueue(pulse).await;
    StatusCode::NO_CONTENT.into_response()
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
