//! Helper configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::RetryPolicy;
use crate::worker::ExecutionMode;

/// Which evaluation worker the helper runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerKind {
    /// Evaluate inside the helper process
    #[default]
    InProcess,
    /// Spawn an external evaluation binary per level
    Process { binary: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Name the partner knows this helper by
    pub origin: String,
    /// Partner-readable directory for non-final partial results
    pub shared_dir: PathBuf,
    /// Private directory for prefix files and evaluation contexts
    pub work_dir: PathBuf,
    /// Spool directory of the request channel
    pub channel_dir: PathBuf,
    /// Address of the identity endpoint
    pub listen_addr: SocketAddr,
    /// Partner's identity endpoint, checked at start-up when set
    #[serde(default)]
    pub partner_url: Option<String>,
    /// Key-decryption parameters forwarded to external workers
    #[serde(default)]
    pub private_key_params_uri: Option<String>,
    #[serde(default)]
    pub worker: WorkerKind,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// How often an idle spool is rescanned
    pub poll_interval_ms: u64,
    /// Serve Prometheus metrics at `/metrics`
    #[serde(default)]
    pub metrics: bool,
}

impl HelperConfig {
    /// Configuration with every directory under `base_dir`
    pub fn from_base_dir(base_dir: impl AsRef<Path>) -> Self {
        let base = base_dir.as_ref();
        Self {
            origin: "helper".into(),
            shared_dir: base.join("shared"),
            work_dir: base.join("work"),
            channel_dir: base.join("channel"),
            listen_addr: ([127, 0, 0, 1], 3100).into(),
            partner_url: None,
            private_key_params_uri: None,
            worker: WorkerKind::InProcess,
            mode: ExecutionMode::Direct,
            retry: RetryPolicy::default(),
            poll_interval_ms: 500,
            metrics: false,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> hierhist_core::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> hierhist_core::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self::from_base_dir("./hierhist-data")
    }
}
