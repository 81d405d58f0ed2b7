use crate::metrics::collector::PrometheusMetrics;
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Writes the metrics in node-exporter textfile format
pub struct TextfileExporter {
    metrics: Arc<PrometheusMetrics>,
    path: PathBuf,
}

impl TextfileExporter {
    pub fn new(metrics: Arc<PrometheusMetrics>, path: impl Into<PathBuf>) -> Self {
        Self {
            metrics,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file atomically so scrapers never see a partial write
    pub async fn write_once(&self) -> Result<()> {
        let text = self.metrics.render()?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, text.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Wrote metrics to {}", self.path.display());
        Ok(())
    }

    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        info!("Exporting metrics to {} every {:?}", self.path.display(), period);

        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.write_once().await {
                        warn!("Failed to export metrics: {}", e);
                    }
                }
            }
        }

        if let Err(e) = self.write_once().await {
            warn!("Failed to export final metrics: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk_apptainer_provider::{OperationKind, OperationOutcome, ProviderMetrics};

    #[tokio::test]
    async fn test_write_once_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vk_apptainer.prom");
        std::fs::write(&path, "stale").unwrap();

        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        metrics.operation_finished(
            OperationKind::Delete,
            OperationOutcome::Failed,
            Duration::from_secs(2),
        );
        let exporter = TextfileExporter::new(metrics, &path);

        exporter.write_once().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("vk_apptainer_operations_total{kind=\"delete\",outcome=\"failed\"} 1"));
        assert!(!dir.path().join("vk_apptainer.prom.tmp").exists());
    }
}
