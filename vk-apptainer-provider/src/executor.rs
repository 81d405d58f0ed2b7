//! Remote executor contract consumed by the lifecycle engine
//!
//! The engine never talks to a backend directly. Everything it needs from
//! the remote side goes through [`RemoteExecutor`], and every call is
//! issued through [`bounded`] so that a single unresponsive instance can
//! only stall its own pod.
//!
//! Implementations are expected to be cancel-safe: the engine cancels a
//! call by dropping its future, so resources such as child processes must
//! be released on drop.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use vk_apptainer_common::{RemoteHandle, RemoteStatus};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend rejected request: {0}")]
    Permanent(String),

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend call cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// Whether the dispatcher should try the call again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::Transient(_) | ExecutorError::Unreachable(_) | ExecutorError::Timeout(_)
        )
    }
}

/// Byte stream of container output
pub type LogStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Options for [`RemoteExecutor::logs`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub tail_lines: Option<u64>,
    pub limit_bytes: Option<u64>,
    pub follow: bool,
}

/// Streams attached to an exec session
#[derive(Default)]
pub struct ExecIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub tty: bool,
}

impl std::fmt::Debug for ExecIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("tty", &self.tty)
            .finish()
    }
}

/// A backend able to run one container instance per pod
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Cheap, local check run before a create is accepted
    fn validate(&self, _pod: &Pod) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn start(&self, pod: &Pod) -> Result<RemoteHandle, ExecutorError>;

    /// Must succeed when the instance is already gone
    async fn stop(&self, handle: &RemoteHandle) -> Result<(), ExecutorError>;

    /// Converge a running instance to a new spec.
    ///
    /// Backends without in-place reconfiguration restart the instance.
    async fn update(&self, handle: &RemoteHandle, pod: &Pod) -> Result<RemoteHandle, ExecutorError> {
        self.stop(handle).await?;
        self.start(pod).await
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, ExecutorError>;

    async fn logs(&self, handle: &RemoteHandle, opts: &LogOptions) -> Result<LogStream, ExecutorError>;

    async fn exec(
        &self,
        handle: &RemoteHandle,
        command: &[String],
        io: ExecIo,
    ) -> Result<(), ExecutorError>;
}

/// Run a backend call under a deadline and a cancellation token
pub async fn bounded<T, F>(
    call: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T, ExecutorError>
where
    F: Future<Output = Result<T, ExecutorError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
        res = tokio::time::timeout(timeout, call) => {
            res.unwrap_or(Err(ExecutorError::Timeout(timeout)))
        }
    }
}
