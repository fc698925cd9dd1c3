//! Identity exchange between helpers
//!
//! Each helper serves its [`HelperSharedInfo`] so the partner can find the
//! shared directory its partial results are published to.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, response::Json, routing::get, Router};
use hierhist_core::HelperSharedInfo;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::{Result, StepError};

pub const SHARED_INFO_PATH: &str = "/shared-info";

#[derive(Clone)]
struct ServerState {
    shared_info: Arc<HelperSharedInfo>,
    metrics: Option<PrometheusHandle>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub origin: String,
}

async fn get_shared_info(State(state): State<ServerState>) -> Json<HelperSharedInfo> {
    Json(state.shared_info.as_ref().clone())
}

async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        origin: state.shared_info.origin.clone(),
    })
}

async fn render_metrics(State(state): State<ServerState>) -> String {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

/// Router serving `/shared-info`, `/health` and, with a handle, `/metrics`
pub fn create_router(shared_info: HelperSharedInfo, metrics: Option<PrometheusHandle>) -> Router {
    let with_metrics = metrics.is_some();
    let state = ServerState {
        shared_info: Arc::new(shared_info),
        metrics,
    };
    let router = Router::new()
        .route(SHARED_INFO_PATH, get(get_shared_info))
        .route("/health", get(health));
    let router = if with_metrics {
        router.route("/metrics", get(render_metrics))
    } else {
        router
    };
    router.with_state(state)
}

/// Serve `router` on `addr` until `shutdown` turns true
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| StepError::Config(format!("cannot listen on {}: {}", addr, e)))?;
    tracing::info!(%addr, "Serving helper identity");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| StepError::Channel(format!("identity server failed: {}", e)))
}

/// Fetch the partner's identity document from `base_url`
pub async fn read_helper_shared_info(base_url: &str) -> Result<HelperSharedInfo> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| StepError::Config(format!("cannot build HTTP client: {}", e)))?;

    let url = format!("{}{}", base_url.trim_end_matches('/'), SHARED_INFO_PATH);
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| StepError::Channel(format!("GET {}: {}", url, e)))?;
    if !resp.status().is_success() {
        return Err(StepError::Channel(format!("GET {}: {}", url, resp.status())));
    }

    let info: HelperSharedInfo = resp
        .json()
        .await
        .map_err(|e| StepError::Config(format!("invalid shared info from {}: {}", url, e)))?;
    tracing::info!(
        origin = %info.origin,
        shared_dir = %info.shared_dir.display(),
        "Fetched partner shared info"
    );
    Ok(info)
}
