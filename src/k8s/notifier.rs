//! Pushes provider status into the API server

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{debug, info};
use vk_apptainer_provider::status::{PHASE_FAILED, PHASE_SUCCEEDED};
use vk_apptainer_provider::{NotificationSink, PodIdentity};

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a rendered pod is finished and waiting for its object to go away
pub fn ready_for_removal(pod: &Pod) -> bool {
    let finished = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == PHASE_SUCCEEDED || p == PHASE_FAILED);
    finished && pod.metadata.deletion_timestamp.is_some()
}

/// Notification sink writing `status` with merge patches
pub struct KubeStatusSink {
    client: Client,
}

impl KubeStatusSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NotificationSink for KubeStatusSink {
    async fn notify(&self, identity: &PodIdentity, pod: Pod) -> anyhow::Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &identity.namespace);
        let patch = json!({ "status": pod.status });

        match pods
            .patch_status(&identity.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => debug!("Patched status of {}", identity),
            Err(e) if is_not_found(&e) => {
                debug!("Pod {} is gone, dropping status", identity);
                return Ok(());
            }
            Err(e) => return Err(e).with_context(|| format!("patching status of {}", identity)),
        }

        if ready_for_removal(&pod) {
            match pods
                .delete(&identity.name, &DeleteParams::default().grace_period(0))
                .await
            {
                Ok(_) => info!("Removed finished pod {}", identity),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e).with_context(|| format!("deleting {}", identity)),
            }
        }
        Ok(())
    }
}
