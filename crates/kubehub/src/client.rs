//! Kube client construction.

use anyhow::{Context, Result};
use kube::{Client, Config};
use tracing::info;

/// Build a client from the inferred kube config (kubeconfig or in-cluster
/// service account), optionally pointing it at an explicit API URL.
pub async fn get_kube_client(api_url: Option<&str>) -> Result<Client> {
    let mut config = Config::infer().await.context("inferring kube config")?;
    if let Some(url) = api_url.filter(|u| !u.is_empty()) {
        config.cluster_url = url.parse::<http::Uri>().with_context(|| format!("parsing api url {}", url))?;
    }
    info!(cluster = %config.cluster_url, ns = %config.default_namespace, "kube client configured");
    Client::try_from(config).context("building kube client")
}
