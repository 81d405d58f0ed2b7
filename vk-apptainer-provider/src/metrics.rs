//! Metrics hook points
//!
//! The engine reports what it does through [`ProviderMetrics`]; it never
//! owns a registry. Every hook has an empty default so collectors only
//! implement what they export.

use std::time::Duration;
use vk_apptainer_common::LifecycleState;

/// Kind of intent executed by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a dispatched operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationOutcome {
    Applied,
    /// A newer intent for the pod superseded this one
    Superseded,
    Failed,
    Cancelled,
}

impl OperationOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationOutcome::Applied => "applied",
            OperationOutcome::Superseded => "superseded",
            OperationOutcome::Failed => "failed",
            OperationOutcome::Cancelled => "cancelled",
        }
    }
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub polled: usize,
    pub transitions: usize,
    pub unreachable: usize,
    pub discarded: usize,
}

pub trait ProviderMetrics: Send + Sync {
    fn operation_finished(&self, _kind: OperationKind, _outcome: OperationOutcome, _elapsed: Duration) {}

    fn reconcile_finished(&self, _report: &ReconcileReport, _elapsed: Duration) {}

    fn notification_finished(&self, _delivered: bool) {}

    fn records_observed(&self, _counts: &[(LifecycleState, usize)]) {}
}
