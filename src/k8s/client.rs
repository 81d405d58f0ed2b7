use crate::k8s::node::NodeBlueprint;
use crate::{Result, VkError};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Connect with an explicit kubeconfig, or the in-cluster/default chain
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let client = match kubeconfig.filter(|p| p.exists()) {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    VkError::KubernetesError(format!(
                        "Failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| {
                            VkError::KubernetesError(format!("Invalid kubeconfig: {}", e))
                        })?;
                Client::try_from(config)?
            }
            None => Client::try_default().await.map_err(|e| {
                VkError::KubernetesError(format!("Failed to create K8s client: {}", e))
            })?,
        };

        info!("Successfully connected to Kubernetes cluster");

        Ok(Self { client })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn pods_all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Create the node, or bring an existing one in line with the blueprint
    pub async fn register_node(&self, blueprint: &NodeBlueprint) -> Result<()> {
        let nodes = self.nodes();
        let name = blueprint.name.as_str();

        match nodes.get_opt(name).await? {
            None => {
                nodes.create(&PostParams::default(), &blueprint.build()).await?;
                info!("Registered node {}", name);
            }
            Some(_) => {
                let patch = json!({
                    "metadata": { "labels": blueprint.labels() },
                    "spec": { "taints": blueprint.taints() },
                });
                nodes
                    .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                info!("Node {} already exists, updated labels and taints", name);
            }
        }

        self.refresh_node_status(blueprint).await
    }

    pub async fn refresh_node_status(&self, blueprint: &NodeBlueprint) -> Result<()> {
        let patch = json!({ "status": blueprint.status() });
        self.nodes()
            .patch_status(&blueprint.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("Refreshed status of node {}", blueprint.name);
        Ok(())
    }

    /// Refresh node conditions until cancelled
    pub async fn heartbeat(&self, blueprint: NodeBlueprint, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_node_status(&blueprint).await {
                        warn!("Node heartbeat failed: {}", e);
                    }
                }
            }
        }
    }
}
