//! Pod lifecycle engine for vk-apptainer
//!
//! Responsibilities:
//! - Accept create/update/delete intents and answer queries from a local cache
//! - Execute intents against a remote executor, ordered per pod and bounded overall
//! - Periodically reconcile cached state with what the backend reports
//! - Push every observable transition to a notification sink
//!
//! The engine is backend agnostic; [`ssh::ApptainerSshExecutor`] drives
//! Apptainer instances on a login node over the system `ssh` client.

mod dispatcher;
mod reconciler;

pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod notify;
pub mod provider;
pub mod record;
pub mod retry;
pub mod ssh;
pub mod status;
pub mod store;

pub use config::ProviderConfig;
pub use error::{ProviderError, Result};
pub use executor::{ExecIo, ExecutorError, LogOptions, LogStream, RemoteExecutor};
pub use metrics::{OperationKind, OperationOutcome, ProviderMetrics, ReconcileReport};
pub use notify::NotificationSink;
pub use provider::{ApptainerProvider, DeleteOutcome, PodLifecycle};
pub use reconciler::REASON_BACKEND_UNREACHABLE;
pub use record::{identity_of, PodRecord};
pub use retry::RetryPolicy;
pub use vk_apptainer_common::{ExitInfo, LifecycleState, PodIdentity, RemoteHandle, RemoteStatus};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
