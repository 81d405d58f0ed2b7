#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use vk_apptainer_provider::{
    ApptainerProvider, ExecIo, ExecutorError, ExitInfo, LogOptions, LogStream, NotificationSink,
    PodIdentity, ProviderConfig, RemoteExecutor, RemoteHandle, RemoteStatus, RetryPolicy,
};

#[derive(Default)]
struct Backend {
    instances: HashMap<RemoteHandle, RemoteStatus>,
    start_failures: VecDeque<ExecutorError>,
    stop_failures: VecDeque<ExecutorError>,
    unreachable: bool,
    reuse_names: bool,
    next_id: u64,
    start_calls: usize,
    stop_calls: usize,
}

/// In-memory backend with scriptable failures
#[derive(Default)]
pub struct ScriptedExecutor {
    backend: Mutex<Backend>,
    start_delay: Mutex<Duration>,
    /// (look at the backend after, answer after)
    status_lag: Mutex<Option<(Duration, Duration)>>,
    next_stop_delay: Mutex<Option<Duration>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    /// Name instances after the pod like the SSH executor does
    pub fn reuse_instance_names(&self) {
        self.backend.lock().unwrap().reuse_names = true;
    }

    /// Status calls read the backend after `observe` and return after `answer`
    pub fn set_status_lag(&self, observe: Duration, answer: Duration) {
        *self.status_lag.lock().unwrap() = Some((observe, answer));
    }

    pub fn clear_status_lag(&self) {
        *self.status_lag.lock().unwrap() = None;
    }

    /// Slow down only the next stop call
    pub fn delay_next_stop(&self, delay: Duration) {
        *self.next_stop_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_next_starts(&self, errors: Vec<ExecutorError>) {
        self.backend.lock().unwrap().start_failures.extend(errors);
    }

    pub fn fail_next_stops(&self, errors: Vec<ExecutorError>) {
        self.backend.lock().unwrap().stop_failures.extend(errors);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.backend.lock().unwrap().unreachable = unreachable;
    }

    /// Make the main process of an instance exit
    pub fn exit(&self, handle: &RemoteHandle, code: i32) {
        self.backend
            .lock()
            .unwrap()
            .instances
            .insert(handle.clone(), RemoteStatus::Exited(ExitInfo::with_code(code)));
    }

    pub fn live_instances(&self) -> usize {
        self.backend.lock().unwrap().instances.len()
    }

    pub fn start_calls(&self) -> usize {
        self.backend.lock().unwrap().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.backend.lock().unwrap().stop_calls
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn start(&self, pod: &Pod) -> Result<RemoteHandle, ExecutorError> {
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut backend = self.backend.lock().unwrap();
        backend.start_calls += 1;
        if let Some(err) = backend.start_failures.pop_front() {
            return Err(err);
        }
        backend.next_id += 1;
        let name = pod.metadata.name.clone().unwrap_or_default();
        let handle = if backend.reuse_names {
            RemoteHandle::new(format!("inst-{}", name))
        } else {
            RemoteHandle::new(format!("inst-{}-{}", name, backend.next_id))
        };
        backend.instances.insert(handle.clone(), RemoteStatus::Running);
        Ok(handle)
    }

    async fn stop(&self, handle: &RemoteHandle) -> Result<(), ExecutorError> {
        let delay = self.next_stop_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut backend = self.backend.lock().unwrap();
        backend.stop_calls += 1;
        if let Some(err) = backend.stop_failures.pop_front() {
            return Err(err);
        }
        backend.instances.remove(handle);
        Ok(())
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, ExecutorError> {
        let lag = *self.status_lag.lock().unwrap();
        if let Some((observe, _)) = lag {
            tokio::time::sleep(observe).await;
        }

        let status = {
            let backend = self.backend.lock().unwrap();
            if backend.unreachable {
                RemoteStatus::Unreachable
            } else {
                backend
                    .instances
                    .get(handle)
                    .cloned()
                    .unwrap_or_else(|| RemoteStatus::Exited(ExitInfo::lost("InstanceLost")))
            }
        };

        if let Some((observe, answer)) = lag {
            tokio::time::sleep(answer.saturating_sub(observe)).await;
        }
        Ok(status)
    }

    async fn logs(&self, handle: &RemoteHandle, _opts: &LogOptions) -> Result<LogStream, ExecutorError> {
        let line = Bytes::from(format!("hello from {}\n", handle));
        Ok(Box::pin(futures::stream::iter(vec![Ok(line)])))
    }

    async fn exec(
        &self,
        _handle: &RemoteHandle,
        command: &[String],
        io: ExecIo,
    ) -> Result<(), ExecutorError> {
        if let Some(mut stdout) = io.stdout {
            stdout
                .write_all(command.join(" ").as_bytes())
                .await
                .map_err(|e| ExecutorError::Transient(e.to_string()))?;
        }
        Ok(())
    }
}

/// Sink remembering the phase of every notification
#[derive(Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<(PodIdentity, String)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn phases(&self, identity: &PodIdentity) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == identity)
            .map(|(_, phase)| phase.clone())
            .collect()
    }

    pub fn count(&self, identity: &PodIdentity, phase: &str) -> usize {
        self.phases(identity).iter().filter(|p| *p == phase).count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, identity: &PodIdentity, pod: Pod) -> anyhow::Result<()> {
        let phase = pod
            .status
            .and_then(|s| s.phase)
            .unwrap_or_else(|| "Unknown".to_string());
        self.seen.lock().unwrap().push((identity.clone(), phase));
        Ok(())
    }
}

pub fn test_config() -> ProviderConfig {
    ProviderConfig {
        workers: 4,
        resync_period: Duration::from_millis(20),
        op_timeout: Duration::from_secs(1),
        status_timeout: Duration::from_millis(200),
        notify_timeout: Duration::from_millis(200),
        unreachable_grace: Duration::from_millis(100),
        terminated_retention: Duration::from_secs(600),
        reconcile_concurrency: 4,
        retry: RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20)),
        host_ip: Some("10.0.0.7".to_string()),
    }
}

pub struct Harness {
    pub provider: ApptainerProvider,
    pub executor: Arc<ScriptedExecutor>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ProviderConfig) -> Self {
        let executor = ScriptedExecutor::new();
        let sink = RecordingSink::new();
        let provider = ApptainerProvider::new(executor.clone(), sink.clone(), config, None);
        provider.start();
        Self {
            provider,
            executor,
            sink,
        }
    }
}

pub fn pod(namespace: &str, name: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            node_name: Some("vk-apptainer".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Poll until the condition holds, failing after a few seconds
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
