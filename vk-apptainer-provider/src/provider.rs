//! The provider facade
//!
//! [`ApptainerProvider`] wires the store, dispatcher and reconciler
//! together and exposes the orchestrator-facing [`PodLifecycle`] surface.
//! Commands only touch the store and the dispatcher queue; queries are
//! served from store copies and never wait on the backend.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use vk_apptainer_common::{LifecycleState, PodIdentity};

use crate::config::ProviderConfig;
use crate::dispatcher::{Dispatcher, DispatcherParts};
use crate::error::{ProviderError, Result};
use crate::executor::{bounded, ExecIo, LogOptions, LogStream, RemoteExecutor};
use crate::metrics::{OperationKind, ProviderMetrics};
use crate::notify::{NotificationSink, Notifier};
use crate::reconciler::{Reconciler, ReconcilerParts};
use crate::record::{identity_of, PodRecord};
use crate::status::{render_pod, render_status, RenderContext};
use crate::store::PodStore;

/// What a delete call set in motion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Teardown was queued
    Enqueued,
    /// A teardown is already queued
    InProgress,
    /// Unknown or already terminated pod
    NothingToDo,
}

/// Lifecycle methods the orchestrator glue drives
#[async_trait]
pub trait PodLifecycle: Send + Sync {
    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    async fn update_pod(&self, pod: &Pod) -> Result<()>;

    async fn delete_pod(&self, pod: &Pod) -> Result<DeleteOutcome>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus>;

    async fn get_pods(&self) -> Result<Vec<Pod>>;

    /// Container output, streamed from the backend
    async fn get_container_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        container: &str,
        opts: &LogOptions,
    ) -> Result<LogStream>;

    /// Run a command inside the pod's instance with attached streams
    async fn run_in_container(
        &self,
        namespace: &str,
        pod_name: &str,
        container: &str,
        command: &[String],
        io: ExecIo,
    ) -> Result<()>;
}

/// Lifecycle engine backed by a [`RemoteExecutor`]
pub struct ApptainerProvider {
    store: PodStore,
    dispatcher: Dispatcher,
    executor: Arc<dyn RemoteExecutor>,
    notifier: Notifier,
    metrics: Option<Arc<dyn ProviderMetrics>>,
    config: ProviderConfig,
    render: RenderContext,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ApptainerProvider {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        sink: Arc<dyn NotificationSink>,
        config: ProviderConfig,
        metrics: Option<Arc<dyn ProviderMetrics>>,
    ) -> Self {
        let store = PodStore::new();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let render = RenderContext {
            host_ip: config.host_ip.clone(),
        };
        let notifier = Notifier::new(
            sink,
            store.clone(),
            config.notify_timeout,
            render.clone(),
            metrics.clone(),
        );
        let dispatcher = Dispatcher::new(DispatcherParts {
            store: store.clone(),
            executor: executor.clone(),
            notifier: notifier.clone(),
            metrics: metrics.clone(),
            retry: config.retry.clone(),
            op_timeout: config.op_timeout,
            workers: config.workers,
            tracker: tracker.clone(),
            cancel: cancel.child_token(),
        });

        Self {
            store,
            dispatcher,
            executor,
            notifier,
            metrics,
            config,
            render,
            tracker,
            cancel,
        }
    }

    /// Spawn the reconciler and the record garbage collector
    pub fn start(&self) {
        let reconciler = self.reconciler();
        self.tracker.spawn(reconciler.run());

        let store = self.store.clone();
        let cancel = self.cancel.child_token();
        let period = self.config.resync_period;
        let retention = self.config.terminated_retention;
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = store.collect_garbage(retention);
                        if purged > 0 {
                            debug!("Purged {} terminated pod records", purged);
                        }
                    }
                }
            }
        });

        info!(
            "Provider started with {} workers, resync every {:?}",
            self.config.workers, self.config.resync_period
        );
    }

    /// Cancel in-flight work and wait for every background task
    pub async fn shutdown(&self) {
        info!("Shutting down provider");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Provider stopped");
    }

    /// Run a single reconciliation pass now
    pub async fn reconcile_now(&self) -> crate::metrics::ReconcileReport {
        self.reconciler().reconcile_once().await
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(ReconcilerParts {
            store: self.store.clone(),
            executor: self.executor.clone(),
            notifier: self.notifier.clone(),
            metrics: self.metrics.clone(),
            resync_period: self.config.resync_period,
            status_timeout: self.config.status_timeout,
            stop_timeout: self.config.op_timeout,
            unreachable_grace: self.config.unreachable_grace,
            concurrency: self.config.reconcile_concurrency,
            cancel: self.cancel.child_token(),
        })
    }

    /// Copy of the cached record
    pub fn record(&self, identity: &PodIdentity) -> Option<PodRecord> {
        self.store.get(identity)
    }

    /// Copy of every cached record
    pub fn records(&self) -> Vec<PodRecord> {
        self.store.list()
    }

    /// Number of pods with queued or running operations
    pub fn busy_pods(&self) -> usize {
        self.dispatcher.busy_lanes()
    }

    pub fn create(&self, pod: &Pod) -> Result<u64> {
        let identity = identity_of(pod)?;
        self.executor.validate(pod)?;
        let spec = Arc::new(pod.clone());

        let generation = self.store.upsert(&identity, |slot| {
            let (generation, leftover, release_pending) = match slot.as_ref() {
                Some(existing) if !existing.is_terminal() => {
                    return Err(ProviderError::Conflict {
                        identity: identity.clone(),
                        state: existing.state.to_string(),
                    });
                }
                Some(existing) => (
                    existing.generation + 1,
                    existing.leftover_handle.clone(),
                    existing.release_pending,
                ),
                None => (1, None, false),
            };
            let mut record = PodRecord::pending(identity.clone(), spec, generation);
            record.leftover_handle = leftover;
            record.release_pending = release_pending;
            *slot = Some(record);
            Ok(generation)
        })?;

        info!("Accepted create of {} at generation {}", identity, generation);
        self.dispatcher
            .enqueue(identity, OperationKind::Create, generation);
        Ok(generation)
    }

    /// Accept a new spec; returns the new generation when work was queued
    pub fn update(&self, pod: &Pod) -> Result<Option<u64>> {
        let identity = identity_of(pod)?;
        self.executor.validate(pod)?;
        let spec = Arc::new(pod.clone());

        let queued = self.store.upsert(&identity, |slot| {
            let record = slot
                .as_mut()
                .ok_or_else(|| ProviderError::not_found(&identity))?;
            if matches!(
                record.state,
                LifecycleState::Terminating | LifecycleState::Terminated
            ) {
                return Err(ProviderError::Conflict {
                    identity: identity.clone(),
                    state: record.state.to_string(),
                });
            }
            let spec_changed = record.spec.spec != spec.spec;
            record.spec = spec;
            if !spec_changed {
                return Ok(None);
            }
            Ok(Some(record.bump_generation()))
        })?;

        match queued {
            Some(generation) => {
                info!("Accepted update of {} at generation {}", identity, generation);
                self.dispatcher
                    .enqueue(identity, OperationKind::Update, generation);
            }
            None => debug!("Refreshed metadata of {}", identity),
        }
        Ok(queued)
    }

    /// Idempotent teardown request
    pub fn delete(&self, identity: &PodIdentity, snapshot: Option<&Pod>) -> Result<DeleteOutcome> {
        let queued = self.store.upsert(identity, |slot| {
            let Some(record) = slot.as_mut() else {
                return Ok(None);
            };
            if let Some(pod) = snapshot {
                record.spec = Arc::new(pod.clone());
            }
            match record.state {
                LifecycleState::Terminating => return Ok(Some(None)),
                LifecycleState::Terminated if record.leftover_handle.is_none() => {
                    record.acknowledged = true;
                    return Ok(None);
                }
                _ => {}
            }
            let handle = record.backend_handle().cloned();
            record.state = LifecycleState::Terminating;
            record.remote_handle = handle;
            record.leftover_handle = None;
            Ok(Some(Some(record.bump_generation())))
        })?;

        let outcome = match queued {
            None => DeleteOutcome::NothingToDo,
            Some(None) => DeleteOutcome::InProgress,
            Some(Some(generation)) => {
                info!("Accepted delete of {} at generation {}", identity, generation);
                self.dispatcher
                    .enqueue(identity.clone(), OperationKind::Delete, generation);
                DeleteOutcome::Enqueued
            }
        };
        Ok(outcome)
    }

    /// Rendered copy of one pod; marks terminal records as delivered
    pub fn query(&self, identity: &PodIdentity) -> Result<Pod> {
        let record = self
            .store
            .get(identity)
            .ok_or_else(|| ProviderError::not_found(identity))?;
        self.acknowledge_if_terminal(&record);
        Ok(render_pod(&record, &self.render))
    }

    pub fn query_status(&self, identity: &PodIdentity) -> Result<PodStatus> {
        let record = self
            .store
            .get(identity)
            .ok_or_else(|| ProviderError::not_found(identity))?;
        self.acknowledge_if_terminal(&record);
        Ok(render_status(&record, &self.render))
    }

    pub fn query_all(&self) -> Vec<Pod> {
        self.store
            .list()
            .iter()
            .map(|record| {
                self.acknowledge_if_terminal(record);
                render_pod(record, &self.render)
            })
            .collect()
    }

    fn acknowledge_if_terminal(&self, record: &PodRecord) {
        if record.is_terminal() {
            self.store.acknowledge(&record.identity, record.generation);
        }
    }

    fn running_handle(&self, identity: &PodIdentity) -> Result<vk_apptainer_common::RemoteHandle> {
        let record = self
            .store
            .get(identity)
            .ok_or_else(|| ProviderError::not_found(identity))?;
        record.live_handle().cloned().ok_or_else(|| {
            ProviderError::BackendPermanent(format!(
                "pod {} has no running instance ({})",
                identity, record.state
            ))
        })
    }
}

#[async_trait]
impl PodLifecycle for ApptainerProvider {
    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        self.create(pod).map(|_| ())
    }

    async fn update_pod(&self, pod: &Pod) -> Result<()> {
        self.update(pod).map(|_| ())
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<DeleteOutcome> {
        let identity = identity_of(pod)?;
        self.delete(&identity, Some(pod))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.query(&PodIdentity::new(namespace, name))
    }

    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus> {
        self.query_status(&PodIdentity::new(namespace, name))
    }

    async fn get_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.query_all())
    }

    async fn get_container_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        _container: &str,
        opts: &LogOptions,
    ) -> Result<LogStream> {
        let handle = self.running_handle(&PodIdentity::new(namespace, pod_name))?;
        let stream = bounded(
            self.executor.logs(&handle, opts),
            self.config.op_timeout,
            &self.cancel,
        )
        .await?;
        Ok(stream)
    }

    async fn run_in_container(
        &self,
        namespace: &str,
        pod_name: &str,
        _container: &str,
        command: &[String],
        io: ExecIo,
    ) -> Result<()> {
        let handle = self.running_handle(&PodIdentity::new(namespace, pod_name))?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProviderError::Cancelled),
            res = self.executor.exec(&handle, command, io) => res.map_err(ProviderError::from),
        }
    }
}
