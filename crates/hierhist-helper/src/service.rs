//! Long-running helper service

use std::sync::Arc;

use hierhist_core::HelperSharedInfo;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::channel::{consume, ConsumeStats, RequestChannel, SpoolChannel};
use crate::config::{HelperConfig, WorkerKind};
use crate::error::Result;
use crate::server::{create_router, read_helper_shared_info, serve};
use crate::store::{BlobStore, LocalStore};
use crate::worker::{EvaluationWorker, InProcessWorker, ProcessWorker};

/// One helper: identity endpoint plus a consumer of the request channel.
///
/// Everything is set up in [`HelperService::new`] and released when the
/// service is dropped.
pub struct HelperService {
    config: HelperConfig,
    channel: Arc<SpoolChannel>,
    aggregator: Aggregator,
    metrics: Option<PrometheusHandle>,
}

impl HelperService {
    pub async fn new(config: HelperConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.shared_dir).await?;
        tokio::fs::create_dir_all(&config.work_dir).await?;

        let store: Arc<dyn BlobStore> = Arc::new(LocalStore::new());
        let channel = Arc::new(
            SpoolChannel::open(
                &config.channel_dir,
                config.retry.clone(),
                config.poll_interval(),
            )
            .await?,
        );

        let worker: Arc<dyn EvaluationWorker> = match &config.worker {
            WorkerKind::InProcess => Arc::new(InProcessWorker::new(store.clone())),
            WorkerKind::Process { binary } => Arc::new(ProcessWorker::new(binary)),
        };

        let shared_info = HelperSharedInfo::new(&config.origin, &config.shared_dir);
        let aggregator = Aggregator::new(
            store,
            worker,
            channel.clone(),
            shared_info,
            &config.work_dir,
        )
        .with_key_params_uri(config.private_key_params_uri.clone())
        .with_mode(config.mode.clone());

        Ok(Self {
            config,
            channel,
            aggregator,
            metrics: None,
        })
    }

    /// Serve metrics from `handle` at `/metrics`
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn shared_info(&self) -> &HelperSharedInfo {
        self.aggregator.shared_info()
    }

    /// Channel that query steps for this helper are published to
    pub fn channel(&self) -> Arc<dyn RequestChannel> {
        self.channel.clone()
    }

    /// Serve the identity endpoint and process query steps until `shutdown`
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<ConsumeStats> {
        info!(
            origin = %self.config.origin,
            shared_dir = %self.config.shared_dir.display(),
            spool = %self.channel.root().display(),
            worker = ?self.config.worker,
            runner = self.config.mode.runner(),
            "Starting helper service"
        );

        if let Some(url) = &self.config.partner_url {
            match read_helper_shared_info(url).await {
                Ok(partner) if partner.origin == self.config.origin => {
                    warn!(origin = %partner.origin, "Partner reports the same origin as this helper");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, url = %url, "Partner identity not reachable yet"),
            }
        }

        let router = create_router(self.shared_info().clone(), self.metrics.clone());
        let server = tokio::spawn(serve(self.config.listen_addr, router, shutdown.clone()));

        let stats = consume(self.channel.as_ref(), &self.aggregator, shutdown).await;
        if stats.is_err() {
            server.abort();
        }

        match server.await {
            Ok(Err(e)) => warn!(error = %e, "Identity server stopped with an error"),
            Err(e) if !e.is_cancelled() => warn!(error = %e, "Identity server task failed"),
            _ => {}
        }
        stats
    }
}

impl Drop for HelperService {
    fn drop(&mut self) {
        info!(origin = %self.config.origin, "Helper service stopped");
    }
}
