//! Pod watcher feeding the lifecycle engine
//!
//! Watches pods bound to this node and turns API events into provider
//! intents. A relist after every reconnect is diffed against the provider's
//! records so pods deleted while the watch was down are torn down too.

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vk_apptainer_provider::{
    identity_of, ApptainerProvider, DeleteOutcome, PodIdentity, PodLifecycle, ProviderError,
};

use crate::Result;

/// What the watcher should do with an applied pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodAction {
    Create,
    Update,
    Delete,
    /// Deleting a pod the provider never ran
    Remove,
    Ignore,
}

/// Decide how an applied pod maps onto the provider
pub fn classify_apply(pod: &Pod, known: Option<&vk_apptainer_provider::PodRecord>) -> PodAction {
    if pod.metadata.deletion_timestamp.is_some() {
        return match known {
            Some(_) => PodAction::Delete,
            None => PodAction::Remove,
        };
    }
    match known {
        Some(record) if record.is_terminal() => PodAction::Ignore,
        Some(_) => PodAction::Update,
        None => {
            let finished = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|p| p == "Succeeded" || p == "Failed");
            if finished {
                PodAction::Ignore
            } else {
                PodAction::Create
            }
        }
    }
}

pub struct PodWatcher {
    client: Client,
    node_name: String,
    provider: Arc<ApptainerProvider>,
}

impl PodWatcher {
    pub fn new(client: Client, node_name: impl Into<String>, provider: Arc<ApptainerProvider>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            provider,
        }
    }

    /// Watch until cancelled, reconnecting with capped backoff
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Starting pod watcher for node {}", self.node_name);

        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(30);

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.watch_pods() => res,
            };

            match outcome {
                Ok(()) => {
                    warn!("Pod watch stream ended, reconnecting...");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    error!("Pod watch failed: {}, reconnecting in {:?}", e, backoff);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }
        }

        info!("Pod watcher stopped");
        Ok(())
    }

    async fn watch_pods(&self) -> std::result::Result<(), watcher::Error> {
        let config = watcher::Config::default().fields(&format!("spec.nodeName={}", self.node_name));
        let pods: Api<Pod> = Api::all(self.client.clone());
        let mut stream = watcher::watcher(pods, config).boxed();
        let mut listed: HashSet<PodIdentity> = HashSet::new();

        while let Some(event) = stream.try_next().await? {
            match event {
                Event::Init => listed.clear(),
                Event::InitApply(pod) => {
                    if let Ok(id) = identity_of(&pod) {
                        listed.insert(id);
                    }
                    self.handle_pod_apply(&pod).await;
                }
                Event::InitDone => {
                    self.resync(&listed).await;
                    listed.clear();
                }
                Event::Apply(pod) => self.handle_pod_apply(&pod).await,
                Event::Delete(pod) => self.handle_pod_delete(&pod).await,
            }
        }

        Ok(())
    }

    async fn handle_pod_apply(&self, pod: &Pod) {
        let identity = match identity_of(pod) {
            Ok(id) => id,
            Err(e) => {
                warn!("Ignoring pod: {}", e);
                return;
            }
        };
        let known = self.provider.record(&identity);

        let res = match classify_apply(pod, known.as_ref()) {
            PodAction::Create => self.provider.create_pod(pod).await,
            PodAction::Update => self.provider.update_pod(pod).await,
            PodAction::Delete => match self.provider.delete_pod(pod).await {
                // finished before the deletion request, nothing will notify
                Ok(DeleteOutcome::NothingToDo) => {
                    self.remove(&identity).await;
                    Ok(())
                }
                res => res.map(|_| ()),
            },
            PodAction::Remove => {
                self.remove(&identity).await;
                Ok(())
            }
            PodAction::Ignore => Ok(()),
        };

        match res {
            Ok(()) => {}
            Err(ProviderError::Conflict { .. }) => debug!("Pod {} already in flight", identity),
            Err(e) => warn!("Failed to handle pod {}: {}", identity, e),
        }
    }

    async fn handle_pod_delete(&self, pod: &Pod) {
        match self.provider.delete_pod(pod).await {
            Ok(outcome) => debug!("Deleted pod event handled: {:?}", outcome),
            Err(e) => warn!("Failed to handle pod deletion: {}", e),
        }
    }

    /// Force-delete a pod object nothing is running for
    async fn remove(&self, identity: &PodIdentity) {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &identity.namespace);
        match pods
            .delete(&identity.name, &DeleteParams::default().grace_period(0))
            .await
        {
            Ok(_) => info!("Removed pod {}", identity),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => warn!("Failed to remove pod {}: {}", identity, e),
        }
    }

    /// Tear down pods the API server no longer lists for this node
    async fn resync(&self, listed: &HashSet<PodIdentity>) {
        let stale: Vec<PodIdentity> = self
            .provider
            .records()
            .into_iter()
            .filter(|r| !r.is_terminal() && !listed.contains(&r.identity))
            .map(|r| r.identity)
            .collect();

        info!(
            "Resynced {} pods from the API server, {} stale",
            listed.len(),
            stale.len()
        );

        for identity in stale {
            if let Err(e) = self.provider.delete(&identity, None) {
                warn!("Failed to delete stale pod {}: {}", identity, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use vk_apptainer_provider::PodRecord;

    fn pod(phase: Option<&str>, deleting: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                deletion_timestamp: deleting.then(|| Time(chrono::Utc::now())),
                ..Default::default()
            },
            status: phase.map(|p| PodStatus {
                phase: Some(p.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn record(p: &Pod) -> PodRecord {
        PodRecord::pending(identity_of(p).unwrap(), Arc::new(p.clone()), 1)
    }

    #[test]
    fn test_new_pod_is_created() {
        assert_eq!(classify_apply(&pod(Some("Pending"), false), None), PodAction::Create);
        assert_eq!(classify_apply(&pod(None, false), None), PodAction::Create);
    }

    #[test]
    fn test_finished_unknown_pod_is_ignored() {
        assert_eq!(classify_apply(&pod(Some("Succeeded"), false), None), PodAction::Ignore);
        assert_eq!(classify_apply(&pod(Some("Failed"), false), None), PodAction::Ignore);
    }

    #[test]
    fn test_known_pod_is_updated_or_deleted() {
        let p = pod(Some("Running"), false);
        let rec = record(&p);
        assert_eq!(classify_apply(&p, Some(&rec)), PodAction::Update);
        assert_eq!(classify_apply(&pod(Some("Running"), true), Some(&rec)), PodAction::Delete);
        assert_eq!(classify_apply(&pod(Some("Running"), true), None), PodAction::Remove);
    }
}
