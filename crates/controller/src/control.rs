//! Control-plane reachability probe.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Succeeds when the API server answers.
    async fn probe(&self) -> Result<()>;
    /// Drop the client; later probes fail.
    async fn release(&self);
}

pub struct KubeControlPlane {
    client: Mutex<Option<kube::Client>>,
    timeout: Duration,
}

impl KubeControlPlane {
    pub fn new(client: kube::Client, timeout: Duration) -> Self { Self { client: Mutex::new(Some(client)), timeout } }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn probe(&self) -> Result<()> {
        let client = self.client.lock().clone().ok_or_else(|| anyhow!("control plane client released"))?;
        let version = tokio::time::timeout(self.timeout, client.apiserver_version())
            .await
            .map_err(|_| anyhow!("api server did not answer within {:?}", self.timeout))?
            .context("querying api server version")?;
        info!(version = %version.git_version, platform = %version.platform, "control plane reachable");
        Ok(())
    }

    async fn release(&self) {
        if self.client.lock().take().is_some() {
            debug!("control plane client released");
        }
    }
}
