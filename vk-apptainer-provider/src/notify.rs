//! Notification sink contract and bounded delivery

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vk_apptainer_common::PodIdentity;

use crate::metrics::ProviderMetrics;
use crate::record::PodRecord;
use crate::status::{render_pod, RenderContext};
use crate::store::PodStore;

/// Orchestrator callback told about every observable pod transition
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, identity: &PodIdentity, pod: Pod) -> anyhow::Result<()>;
}

/// Delivers rendered records to the sink without ever blocking for long
#[derive(Clone)]
pub(crate) struct Notifier {
    sink: Arc<dyn NotificationSink>,
    store: PodStore,
    timeout: Duration,
    render: RenderContext,
    metrics: Option<Arc<dyn ProviderMetrics>>,
}

impl Notifier {
    pub(crate) fn new(
        sink: Arc<dyn NotificationSink>,
        store: PodStore,
        timeout: Duration,
        render: RenderContext,
        metrics: Option<Arc<dyn ProviderMetrics>>,
    ) -> Self {
        Self {
            sink,
            store,
            timeout,
            render,
            metrics,
        }
    }

    /// Send one record; failures are logged and dropped
    pub(crate) async fn send(&self, record: &PodRecord) -> bool {
        let pod = render_pod(record, &self.render);
        let delivered = match tokio::time::timeout(
            self.timeout,
            self.sink.notify(&record.identity, pod),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!("Notified {} ({})", record.identity, record.state);
                if record.is_terminal() {
                    self.store.acknowledge(&record.identity, record.generation);
                }
                true
            }
            Ok(Err(e)) => {
                warn!(
                    "Dropping notification for {} ({}): {:#}",
                    record.identity, record.state, e
                );
                false
            }
            Err(_) => {
                warn!(
                    "Dropping notification for {} ({}): no answer after {:?}",
                    record.identity, record.state, self.timeout
                );
                false
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.notification_finished(delivered);
        }
        delivered
    }
}
