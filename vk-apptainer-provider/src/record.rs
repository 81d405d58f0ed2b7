//! The cached unit of pod state

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tokio::time::Instant;
use vk_apptainer_common::{ExitInfo, LifecycleState, PodIdentity, RemoteHandle};

use crate::error::{ProviderError, Result};

/// Snapshot of everything the engine knows about one pod.
///
/// Records are plain values: the store hands out clones and applies
/// changes through `PodStore::upsert`, so a record held by a caller never
/// changes underneath it.
#[derive(Debug, Clone)]
pub struct PodRecord {
    pub identity: PodIdentity,
    pub spec: Arc<Pod>,
    pub state: LifecycleState,
    pub remote_handle: Option<RemoteHandle>,
    /// Instance that may outlive a failure; torn down by the next intent
    pub leftover_handle: Option<RemoteHandle>,
    /// The reconciler is still stopping `leftover_handle`
    pub release_pending: bool,
    pub generation: u64,
    pub last_error: Option<String>,
    pub exit: Option<ExitInfo>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub unreachable_since: Option<Instant>,
    pub acknowledged: bool,
}

impl PodRecord {
    /// A fresh `Pending` record for an accepted create
    pub fn pending(identity: PodIdentity, spec: Arc<Pod>, generation: u64) -> Self {
        Self {
            identity,
            spec,
            state: LifecycleState::Pending,
            remote_handle: None,
            leftover_handle: None,
            release_pending: false,
            generation,
            last_error: None,
            exit: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_observed_at: None,
            unreachable_since: None,
            acknowledged: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Live backend instance, if the record's state allows one
    pub fn live_handle(&self) -> Option<&RemoteHandle> {
        self.remote_handle
            .as_ref()
            .filter(|_| self.state.holds_handle())
    }

    /// Handle the next teardown or restart has to act on
    pub fn backend_handle(&self) -> Option<&RemoteHandle> {
        self.live_handle().or(self.leftover_handle.as_ref())
    }

    pub(crate) fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.acknowledged = false;
        self.generation
    }

    pub(crate) fn mark_running(&mut self, handle: RemoteHandle) {
        self.state = LifecycleState::Running;
        self.remote_handle = Some(handle);
        self.leftover_handle = None;
        self.last_error = None;
        self.exit = None;
        self.unreachable_since = None;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
    }

    pub(crate) fn mark_terminated(&mut self, exit: Option<ExitInfo>) {
        self.state = LifecycleState::Terminated;
        self.remote_handle = None;
        self.last_error = None;
        self.unreachable_since = None;
        if exit.is_some() {
            self.exit = exit;
        }
        self.finished_at = Some(Utc::now());
        self.acknowledged = false;
    }

    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>, exit: Option<ExitInfo>) {
        self.state = LifecycleState::Failed;
        self.remote_handle = None;
        self.last_error = Some(reason.into());
        self.unreachable_since = None;
        if exit.is_some() {
            self.exit = exit;
        }
        self.finished_at = Some(Utc::now());
        self.acknowledged = false;
    }

    /// Reject a write computed against an older generation
    pub(crate) fn expect_generation(&self, expected: u64) -> Result<()> {
        if self.generation != expected {
            return Err(ProviderError::StaleGeneration {
                identity: self.identity.clone(),
                expected,
                current: self.generation,
            });
        }
        Ok(())
    }
}

/// Derive the record key from pod metadata
pub fn identity_of(pod: &Pod) -> Result<PodIdentity> {
    let name = pod
        .metadata
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ProviderError::InvalidPod("pod has no name".to_string()))?;
    let namespace = pod
        .metadata
        .namespace
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or("default");
    Ok(PodIdentity::new(namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(namespace: Option<&str>, name: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: namespace.map(str::to_string),
                name: name.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_defaults_namespace() {
        let id = identity_of(&pod(None, Some("job"))).expect("identity");
        assert_eq!(id, PodIdentity::new("default", "job"));
    }

    #[test]
    fn test_identity_requires_name() {
        assert!(matches!(
            identity_of(&pod(Some("hpc"), None)),
            Err(ProviderError::InvalidPod(_))
        ));
    }

    #[test]
    fn test_terminal_marks_clear_handle() {
        let id = PodIdentity::new("hpc", "job");
        let mut record = PodRecord::pending(id, Arc::new(pod(Some("hpc"), Some("job"))), 1);
        record.mark_running(RemoteHandle::new("vk-hpc-job"));
        assert!(record.live_handle().is_some());

        record.mark_failed("BackendUnreachable", None);
        assert!(record.remote_handle.is_none());
        assert_eq!(record.last_error.as_deref(), Some("BackendUnreachable"));

        record.mark_terminated(Some(ExitInfo::with_code(0)));
        assert!(record.last_error.is_none());
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn test_expect_generation() {
        let id = PodIdentity::new("hpc", "job");
        let mut record = PodRecord::pending(id, Arc::new(pod(Some("hpc"), Some("job"))), 3);
        assert!(record.expect_generation(3).is_ok());
        record.bump_generation();
        assert!(matches!(
            record.expect_generation(3),
            Err(ProviderError::StaleGeneration { current: 4, .. })
        ));
    }
}
