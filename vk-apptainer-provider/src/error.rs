use thiserror::Error;
use vk_apptainer_common::PodIdentity;

use crate::executor::ExecutorError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Pod {identity} already exists in state {state}")]
    Conflict { identity: PodIdentity, state: String },

    #[error("Pod {identity} moved to generation {current}, expected {expected}")]
    StaleGeneration {
        identity: PodIdentity,
        expected: u64,
        current: u64,
    },

    #[error("Transient backend failure: {0}")]
    BackendTransient(String),

    #[error("Backend rejected the request: {0}")]
    BackendPermanent(String),

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Pod not found: {name} in namespace {namespace}")]
    NotFound { namespace: String, name: String },

    #[error("Invalid pod: {0}")]
    InvalidPod(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn not_found(identity: &PodIdentity) -> Self {
        ProviderError::NotFound {
            namespace: identity.namespace.clone(),
            name: identity.name.clone(),
        }
    }
}

impl From<ExecutorError> for ProviderError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Transient(msg) => ProviderError::BackendTransient(msg),
            ExecutorError::Permanent(msg) => ProviderError::BackendPermanent(msg),
            ExecutorError::Unreachable(msg) => ProviderError::BackendUnreachable(msg),
            ExecutorError::Timeout(after) => {
                ProviderError::BackendUnreachable(format!("no response after {:?}", after))
            }
            ExecutorError::Cancelled => ProviderError::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
