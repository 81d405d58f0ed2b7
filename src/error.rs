use thiserror::Error;
use vk_apptainer_provider::ProviderError;

#[derive(Error, Debug)]
pub enum VkError {
    #[error("Kubernetes error: {0}")]
    KubernetesError(String),

    #[error("Node {name} was not registered within {timeout:?}")]
    StartupTimeout {
        name: String,
        timeout: std::time::Duration,
    },

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Taint effect {0:?} is not supported")]
    UnsupportedTaintEffect(String),

    #[error("Provider error: {0}")]
    ProviderError(#[from] ProviderError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<kube::Error> for VkError {
    fn from(err: kube::Error) -> Self {
        VkError::KubernetesError(err.to_string())
    }
}

impl From<prometheus::Error> for VkError {
    fn from(err: prometheus::Error) -> Self {
        VkError::MetricsError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VkError>;
