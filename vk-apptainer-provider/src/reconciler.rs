//! Status reconciler
//!
//! Polls the backend for every running record on a fixed period and right
//! after the store reports a state change. Observations are written back
//! with the generation the poll started from, so anything the dispatcher
//! applied in the meantime wins.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vk_apptainer_common::{ExitInfo, LifecycleState, RemoteStatus};

use crate::executor::{bounded, ExecutorError, RemoteExecutor};
use crate::metrics::{ProviderMetrics, ReconcileReport};
use crate::notify::Notifier;
use crate::record::PodRecord;
use crate::store::PodStore;

pub const REASON_BACKEND_UNREACHABLE: &str = "BackendUnreachable";

/// Result of reconciling one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    Confirmed,
    Transitioned,
    Unreachable,
    Discarded,
}

pub(crate) struct ReconcilerParts {
    pub store: PodStore,
    pub executor: Arc<dyn RemoteExecutor>,
    pub notifier: Notifier,
    pub metrics: Option<Arc<dyn ProviderMetrics>>,
    pub resync_period: Duration,
    pub status_timeout: Duration,
    pub stop_timeout: Duration,
    pub unreachable_grace: Duration,
    pub concurrency: usize,
    pub cancel: CancellationToken,
}

/// Background drift detector
pub(crate) struct Reconciler {
    store: PodStore,
    executor: Arc<dyn RemoteExecutor>,
    notifier: Notifier,
    metrics: Option<Arc<dyn ProviderMetrics>>,
    resync_period: Duration,
    status_timeout: Duration,
    stop_timeout: Duration,
    unreachable_grace: Duration,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Reconciler {
    pub(crate) fn new(parts: ReconcilerParts) -> Self {
        Self {
            store: parts.store,
            executor: parts.executor,
            notifier: parts.notifier,
            metrics: parts.metrics,
            resync_period: parts.resync_period,
            status_timeout: parts.status_timeout,
            stop_timeout: parts.stop_timeout,
            unreachable_grace: parts.unreachable_grace,
            concurrency: parts.concurrency.max(1),
            cancel: parts.cancel,
        }
    }

    /// Run passes until cancelled
    pub(crate) async fn run(self) {
        info!(
            "Starting status reconciler (resync every {:?})",
            self.resync_period
        );

        let mut ticker = tokio::time::interval(self.resync_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.store.changed() => {}
            }
            self.reconcile_once().await;
        }

        info!("Status reconciler stopped");
    }

    /// One full pass over the store
    pub(crate) async fn reconcile_once(&self) -> ReconcileReport {
        let started = Instant::now();
        let candidates: Vec<PodRecord> = self
            .store
            .list()
            .into_iter()
            .filter(|r| r.state == LifecycleState::Running && r.remote_handle.is_some())
            .collect();

        let observations: Vec<Observation> = stream::iter(candidates)
            .map(|record| self.observe(record))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = ReconcileReport {
            polled: observations.len(),
            ..Default::default()
        };
        for observation in observations {
            match observation {
                Observation::Confirmed => {}
                Observation::Transitioned => report.transitions += 1,
                Observation::Unreachable => report.unreachable += 1,
                Observation::Discarded => report.discarded += 1,
            }
        }

        if report.transitions > 0 || report.unreachable > 0 {
            info!(
                "Reconciled {} pods: {} transitioned, {} unreachable",
                report.polled, report.transitions, report.unreachable
            );
        } else {
            debug!("Reconciled {} pods, no drift", report.polled);
        }

        if let Some(metrics) = &self.metrics {
            metrics.reconcile_finished(&report, started.elapsed());
            metrics.records_observed(&self.store.count_by_state());
        }
        report
    }

    async fn observe(&self, record: PodRecord) -> Observation {
        let Some(handle) = record.remote_handle.clone() else {
            return Observation::Discarded;
        };

        let observed = match bounded(
            self.executor.status(&handle),
            self.status_timeout,
            &self.cancel,
        )
        .await
        {
            Ok(status) => status,
            Err(ExecutorError::Cancelled) => return Observation::Discarded,
            Err(e) => {
                debug!("Status of {} unavailable: {}", record.identity, e);
                RemoteStatus::Unreachable
            }
        };

        match observed {
            RemoteStatus::Running => self.confirm_running(&record),
            RemoteStatus::Exited(exit) => self.apply_exit(&record, exit).await,
            RemoteStatus::Unreachable => self.apply_unreachable(&record).await,
        }
    }

    fn confirm_running(&self, observed: &PodRecord) -> Observation {
        let res = self
            .store
            .update_at(&observed.identity, observed.generation, |record| {
                if record.state != LifecycleState::Running {
                    return Ok(false);
                }
                record.last_observed_at = Some(chrono::Utc::now());
                record.unreachable_since = None;
                Ok(true)
            });
        match res {
            Ok(true) => Observation::Confirmed,
            _ => Observation::Discarded,
        }
    }

    async fn apply_exit(&self, observed: &PodRecord, exit: ExitInfo) -> Observation {
        let generation = observed.generation;
        let res = self
            .store
            .update_at(&observed.identity, generation, |record| {
                if record.state != LifecycleState::Running {
                    return Ok(None);
                }
                let Some(handle) = record.remote_handle.clone() else {
                    return Ok(None);
                };
                record.last_observed_at = Some(chrono::Utc::now());
                if exit.succeeded() {
                    record.mark_terminated(Some(exit.clone()));
                } else {
                    let reason = match exit.code {
                        Some(code) => format!("{}: exit code {}", exit.reason, code),
                        None => exit.reason.clone(),
                    };
                    record.mark_failed(reason, Some(exit.clone()));
                }
                record.leftover_handle = Some(handle.clone());
                record.release_pending = true;
                Ok(Some((handle, record.clone())))
            });

        let (handle, mut record) = match res {
            Ok(Some(committed)) => committed,
            _ => {
                debug!("Discarding stale exit of {}", observed.identity);
                return Observation::Discarded;
            }
        };

        // the instance outlives its main process
        let stopped = match bounded(self.executor.stop(&handle), self.stop_timeout, &self.cancel).await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to stop exited instance {}: {}", handle, e);
                false
            }
        };

        let released = self.store.upsert(&observed.identity, |slot| {
            let Some(current) = slot.as_mut() else {
                return Ok(None);
            };
            current.release_pending = false;
            if stopped
                && current.generation == generation
                && current.leftover_handle.as_ref() == Some(&handle)
            {
                current.leftover_handle = None;
            }
            Ok(Some(current.clone()))
        });
        if let Ok(Some(current)) = released {
            if current.generation == generation {
                record = current;
            }
        }

        info!("Pod {} exited: {}", record.identity, record.state);
        self.notifier.send(&record).await;
        Observation::Transitioned
    }

    async fn apply_unreachable(&self, observed: &PodRecord) -> Observation {
        let now = tokio::time::Instant::now();
        let grace = self.unreachable_grace;
        let res = self
            .store
            .update_at(&observed.identity, observed.generation, |record| {
                if record.state != LifecycleState::Running {
                    return Ok(None);
                }
                let since = *record.unreachable_since.get_or_insert(now);
                if now.duration_since(since) < grace {
                    return Ok(Some(None));
                }
                record.leftover_handle = record.remote_handle.clone();
                record.mark_failed(REASON_BACKEND_UNREACHABLE, None);
                Ok(Some(Some(record.clone())))
            });

        match res {
            Ok(Some(Some(record))) => {
                warn!(
                    "Pod {} failed: backend unreachable for more than {:?}",
                    record.identity, grace
                );
                self.notifier.send(&record).await;
                Observation::Transitioned
            }
            Ok(Some(None)) => Observation::Unreachable,
            _ => Observation::Discarded,
        }
    }
}
