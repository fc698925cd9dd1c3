//! Helper binary
//!
//! Run with:
//! ```bash
//! cargo run -p hierhist-helper --bin hierhist-helper -- --config helper-a.json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use hierhist_helper::{metrics, HelperConfig, HelperService, WorkerKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hierhist-helper")]
#[command(about = "Aggregate hierarchical histogram shares for one helper")]
struct Args {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective configuration to this file and exit
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Helper origin name
    #[arg(long)]
    origin: Option<String>,

    /// Base directory for shared, work and channel directories
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Identity endpoint address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Partner identity endpoint URL
    #[arg(long)]
    partner_url: Option<String>,

    /// Run evaluation in this external binary instead of in-process
    #[arg(long)]
    worker_binary: Option<PathBuf>,

    /// Serve Prometheus metrics at /metrics
    #[arg(long)]
    metrics: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(HelperConfig, Option<PathBuf>)> {
        let mut config = match &self.config {
            Some(path) => HelperConfig::load(path)?,
            None => HelperConfig::default(),
        };

        if let Some(dir) = self.data_dir {
            let rebased = HelperConfig::from_base_dir(&dir);
            config.shared_dir = rebased.shared_dir;
            config.work_dir = rebased.work_dir;
            config.channel_dir = rebased.channel_dir;
        }
        if let Some(origin) = self.origin {
            config.origin = origin;
        }
        if let Some(addr) = self.listen {
            config.listen_addr = addr;
        }
        if self.partner_url.is_some() {
            config.partner_url = self.partner_url;
        }
        if let Some(binary) = self.worker_binary {
            config.worker = WorkerKind::Process { binary };
        }
        config.metrics |= self.metrics;

        Ok((config, self.write_config))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hierhist_helper=info".parse()?))
        .init();

    let (config, write_config) = Args::parse().into_config()?;

    if let Some(path) = write_config {
        config.save(&path)?;
        println!("[OK] Wrote configuration to {}", path.display());
        return Ok(());
    }

    let mut service = HelperService::new(config.clone()).await?;
    if config.metrics {
        service = service.with_metrics(metrics::init_prometheus_recorder()?);
    }

    let (stop, shutdown) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = stop.send(true);
        }
    });

    let stats = service.run(shutdown).await?;
    println!(
        "[OK] Processed {} steps ({} completed, {} requeued, {} failed)",
        stats.received, stats.completed, stats.requeued, stats.failed
    );
    Ok(())
}
