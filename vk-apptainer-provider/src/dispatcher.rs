//! Operation dispatcher
//!
//! Intents are queued per pod identity. Each identity with queued work has
//! exactly one drain task popping its lane in FIFO order; drain tasks share
//! a semaphore of `workers` permits, so unrelated pods run in parallel up to
//! the pool width while one pod's operations never overlap or reorder.
//!
//! Every task carries the generation of the intent that queued it. A task
//! whose generation is no longer current when it starts is skipped, because
//! a later task for the same pod is already queued behind it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use vk_apptainer_common::{LifecycleState, PodIdentity, RemoteHandle};

use crate::executor::{bounded, ExecutorError, RemoteExecutor};
use crate::metrics::{OperationKind, OperationOutcome, ProviderMetrics};
use crate::notify::Notifier;
use crate::retry::RetryPolicy;
use crate::store::PodStore;

const RELEASE_POLL: Duration = Duration::from_millis(10);
const CANCELLED_REASON: &str = "Cancelled: interrupted before completion";

#[derive(Debug, Clone, Copy)]
struct Task {
    kind: OperationKind,
    generation: u64,
}

#[derive(Default)]
struct Lane {
    tasks: VecDeque<Task>,
    draining: bool,
}

enum CallError {
    /// A newer intent owns the pod now
    Superseded,
    Cancelled,
    Failed { error: ExecutorError, attempts: u32 },
}

/// What to do with a handle returned by start/update
enum Settle {
    Running(Box<crate::record::PodRecord>),
    Adopted,
    Orphaned,
}

/// Bounded, per-identity ordered executor of pod intents
#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    store: PodStore,
    executor: Arc<dyn RemoteExecutor>,
    notifier: Notifier,
    metrics: Option<Arc<dyn ProviderMetrics>>,
    retry: RetryPolicy,
    op_timeout: Duration,
    lanes: DashMap<PodIdentity, Lane>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

pub(crate) struct DispatcherParts {
    pub store: PodStore,
    pub executor: Arc<dyn RemoteExecutor>,
    pub notifier: Notifier,
    pub metrics: Option<Arc<dyn ProviderMetrics>>,
    pub retry: RetryPolicy,
    pub op_timeout: Duration,
    pub workers: usize,
    pub tracker: TaskTracker,
    pub cancel: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(parts: DispatcherParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: parts.store,
                executor: parts.executor,
                notifier: parts.notifier,
                metrics: parts.metrics,
                retry: parts.retry,
                op_timeout: parts.op_timeout,
                lanes: DashMap::new(),
                permits: Arc::new(Semaphore::new(parts.workers.max(1))),
                tracker: parts.tracker,
                cancel: parts.cancel,
            }),
        }
    }

    /// Queue an intent behind everything already queued for the identity
    pub(crate) fn enqueue(&self, identity: PodIdentity, kind: OperationKind, generation: u64) {
        let start_drain = {
            let mut lane = self.inner.lanes.entry(identity.clone()).or_default();
            lane.tasks.push_back(Task { kind, generation });
            !std::mem::replace(&mut lane.draining, true)
        };

        debug!("Queued {} of {} at generation {}", kind, identity, generation);

        if start_drain {
            let inner = self.inner.clone();
            self.inner.tracker.spawn(inner.drain(identity));
        }
    }

    /// Number of identities with queued or running work
    pub(crate) fn busy_lanes(&self) -> usize {
        self.inner.lanes.len()
    }
}

impl Inner {
    async fn drain(self: Arc<Self>, identity: PodIdentity) {
        loop {
            let task = match self.lanes.entry(identity.clone()) {
                Entry::Occupied(mut lane) => match lane.get_mut().tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        lane.remove();
                        return;
                    }
                },
                Entry::Vacant(_) => return,
            };

            let Ok(_permit) = self.permits.clone().acquire_owned().await else {
                return;
            };
            self.execute(&identity, task).await;
        }
    }

    async fn execute(&self, identity: &PodIdentity, task: Task) {
        let started = Instant::now();
        let outcome = match task.kind {
            OperationKind::Create | OperationKind::Update => self.converge(identity, task).await,
            OperationKind::Delete => self.teardown(identity, task).await,
        };

        debug!(
            "{} of {} at generation {} finished: {} in {:?}",
            task.kind,
            identity,
            task.generation,
            outcome.as_str(),
            started.elapsed()
        );

        if let Some(metrics) = &self.metrics {
            metrics.operation_finished(task.kind, outcome, started.elapsed());
        }
    }

    /// Bring the backend instance in line with the record's spec
    async fn converge(&self, identity: &PodIdentity, task: Task) -> OperationOutcome {
        if !self.await_release(identity).await {
            let _ = self.store.update_at(identity, task.generation, |record| {
                record.last_error = Some(CANCELLED_REASON.to_string());
                Ok(())
            });
            return OperationOutcome::Cancelled;
        }

        let claim = self.store.update_at(identity, task.generation, |record| {
            let prior_state = record.state;
            let handle = record.backend_handle().cloned();
            record.state = if record.live_handle().is_some() {
                LifecycleState::Updating
            } else {
                LifecycleState::Creating
            };
            Ok((record.spec.clone(), handle, prior_state))
        });
        let (spec, handle, prior_state) = match claim {
            Ok(claim) => claim,
            Err(e) => {
                debug!("Skipping {} of {}: {}", task.kind, identity, e);
                return OperationOutcome::Superseded;
            }
        };

        let executor = self.executor.as_ref();
        let pod: &Pod = &spec;
        let result = match handle.as_ref() {
            Some(current) => {
                self.call_with_retry(identity, task, || executor.update(current, pod))
                    .await
            }
            None => {
                self.call_with_retry(identity, task, || executor.start(pod))
                    .await
            }
        };

        match result {
            Ok(started) => self.settle_started(identity, task, started).await,
            Err(CallError::Superseded) => OperationOutcome::Superseded,
            Err(CallError::Cancelled) => {
                let _ = self.store.update_at(identity, task.generation, |record| {
                    record.state = prior_state;
                    record.last_error = Some(CANCELLED_REASON.to_string());
                    Ok(())
                });
                OperationOutcome::Cancelled
            }
            Err(CallError::Failed { error, attempts }) => {
                let verb = match task.kind {
                    OperationKind::Create => "StartFailed",
                    _ => "UpdateFailed",
                };
                let reason = format!("{}: {} (after {} attempt(s))", verb, error, attempts);
                let failed = self.store.update_at(identity, task.generation, |record| {
                    record.leftover_handle = handle.clone().or(record.leftover_handle.take());
                    record.mark_failed(reason.clone(), None);
                    Ok(record.clone())
                });
                match failed {
                    Ok(record) => {
                        warn!("Pod {} failed: {}", identity, reason);
                        self.notifier.send(&record).await;
                        OperationOutcome::Failed
                    }
                    Err(_) => OperationOutcome::Superseded,
                }
            }
        }
    }

    async fn settle_started(
        &self,
        identity: &PodIdentity,
        task: Task,
        handle: RemoteHandle,
    ) -> OperationOutcome {
        let settled = self.store.upsert(identity, |slot| {
            let Some(record) = slot.as_mut() else {
                return Ok(Settle::Orphaned);
            };
            if record.generation == task.generation {
                record.mark_running(handle.clone());
                return Ok(Settle::Running(Box::new(record.clone())));
            }
            match record.state {
                LifecycleState::Creating | LifecycleState::Updating | LifecycleState::Terminating => {
                    record.remote_handle = Some(handle.clone());
                    record.leftover_handle = None;
                    Ok(Settle::Adopted)
                }
                _ => Ok(Settle::Orphaned),
            }
        });

        match settled {
            Ok(Settle::Running(record)) => {
                info!("Pod {} running as {}", identity, handle);
                self.notifier.send(&record).await;
                OperationOutcome::Applied
            }
            Ok(Settle::Adopted) => {
                debug!("Pod {} superseded, keeping {} for the next operation", identity, handle);
                OperationOutcome::Superseded
            }
            Ok(Settle::Orphaned) | Err(_) => {
                self.release(identity, &handle).await;
                OperationOutcome::Superseded
            }
        }
    }

    /// Stop the backend instance and mark the record terminated
    async fn teardown(&self, identity: &PodIdentity, task: Task) -> OperationOutcome {
        let claim = self
            .store
            .update_at(identity, task.generation, |record| Ok(record.backend_handle().cloned()));
        let handle = match claim {
            Ok(handle) => handle,
            Err(e) => {
                debug!("Skipping {} of {}: {}", task.kind, identity, e);
                return OperationOutcome::Superseded;
            }
        };

        if let Some(handle) = handle.as_ref() {
            let executor = self.executor.as_ref();
            match self
                .call_with_retry(identity, task, || executor.stop(handle))
                .await
            {
                Ok(()) => {}
                Err(CallError::Superseded) => return OperationOutcome::Superseded,
                Err(CallError::Cancelled) => return OperationOutcome::Cancelled,
                Err(CallError::Failed { error, attempts }) => {
                    let reason = format!("TeardownFailed: {} (after {} attempt(s))", error, attempts);
                    let failed = self.store.update_at(identity, task.generation, |record| {
                        record.leftover_handle = Some(handle.clone());
                        record.mark_failed(reason.clone(), None);
                        Ok(record.clone())
                    });
                    return match failed {
                        Ok(record) => {
                            warn!("Pod {} failed: {}", identity, reason);
                            self.notifier.send(&record).await;
                            OperationOutcome::Failed
                        }
                        Err(_) => OperationOutcome::Superseded,
                    };
                }
            }
        }

        let terminated = self.store.update_at(identity, task.generation, |record| {
            record.leftover_handle = None;
            record.mark_terminated(None);
            Ok(record.clone())
        });
        match terminated {
            Ok(record) => {
                info!("Pod {} terminated", identity);
                self.notifier.send(&record).await;
                OperationOutcome::Applied
            }
            Err(_) => OperationOutcome::Superseded,
        }
    }

    async fn call_with_retry<T, F, Fut>(
        &self,
        identity: &PodIdentity,
        task: Task,
        mut call: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExecutorError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match bounded(call(), self.op_timeout, &self.cancel).await {
                Ok(value) => return Ok(value),
                Err(ExecutorError::Cancelled) => return Err(CallError::Cancelled),
                Err(error) => error,
            };

            if !error.is_retryable() || !self.retry.should_retry(attempt) {
                return Err(CallError::Failed {
                    error,
                    attempts: attempt,
                });
            }

            let delay = self.retry.backoff(attempt);
            warn!(
                "{} of {} failed (attempt {}/{}): {}, retrying in {:?}",
                task.kind, identity, attempt, self.retry.max_attempts, error, delay
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(CallError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            let current = self
                .store
                .get(identity)
                .is_some_and(|r| r.generation == task.generation);
            if !current {
                return Err(CallError::Superseded);
            }
        }
    }

    /// Wait for the reconciler to finish stopping an exited instance.
    ///
    /// Instance names are reused across restarts of the same pod, so a start
    /// racing that stop could be killed by it. Gives up waiting after
    /// `op_timeout`; returns false when cancelled.
    async fn await_release(&self, identity: &PodIdentity) -> bool {
        let deadline = tokio::time::Instant::now() + self.op_timeout;
        while self.store.get(identity).is_some_and(|r| r.release_pending) {
            if tokio::time::Instant::now() >= deadline {
                warn!("Release of {} still pending after {:?}", identity, self.op_timeout);
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(RELEASE_POLL) => {}
            }
        }
        true
    }

    /// Best-effort stop of an instance no record wants
    async fn release(&self, identity: &PodIdentity, handle: &RemoteHandle) {
        match bounded(self.executor.stop(handle), self.op_timeout, &self.cancel).await {
            Ok(()) => debug!("Released {} of {}", handle, identity),
            Err(e) => warn!("Failed to release {} of {}: {}", handle, identity, e),
        }
    }
}
