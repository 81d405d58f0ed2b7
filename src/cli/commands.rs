use crate::cli::Cli;
use crate::config::{NodeSettings, TuningFile};
use crate::k8s::{K8sClient, KubeStatusSink, NodeBlueprint, PodWatcher};
use crate::metrics::{PrometheusMetrics, TextfileExporter};
use crate::{Result, VkError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use vk_apptainer_provider::ssh::{ApptainerSshExecutor, SshTarget};
use vk_apptainer_provider::{ApptainerProvider, ProviderConfig, ProviderMetrics};

/// Engine configuration from flags, environment and the tuning file
pub fn provider_config(cli: &Cli, settings: &NodeSettings) -> Result<ProviderConfig> {
    let mut config = ProviderConfig {
        workers: cli.pod_sync_workers.max(1),
        resync_period: cli.full_resync_period,
        host_ip: settings.pod_ip.clone(),
        ..Default::default()
    };
    if let Some(path) = &cli.config {
        TuningFile::load(path)?.apply(&mut config)?;
        info!("Loaded tuning from {}", path.display());
    }
    Ok(config)
}

pub fn ssh_target(cli: &Cli) -> SshTarget {
    let mut target = SshTarget::new(cli.ssh_host.clone());
    target.user = cli.ssh_user.clone();
    target.port = cli.ssh_port;
    target.identity_file = cli.ssh_key.clone();
    target
}

/// Run the virtual kubelet until interrupted
pub async fn run(cli: Cli) -> Result<()> {
    let settings = NodeSettings::from_env()?;
    let config = provider_config(&cli, &settings)?;
    let resync = config.resync_period;

    let k8s = K8sClient::connect(cli.kubeconfig.as_deref()).await?;
    let metrics = Arc::new(PrometheusMetrics::new()?);
    let executor = ApptainerSshExecutor::new(ssh_target(&cli)).with_apptainer_bin(cli.apptainer_bin.clone());
    let sink = KubeStatusSink::new(k8s.client());

    let provider = Arc::new(ApptainerProvider::new(
        Arc::new(executor),
        Arc::new(sink),
        config,
        Some(metrics.clone() as Arc<dyn ProviderMetrics>),
    ));

    let blueprint = NodeBlueprint {
        name: cli.nodename.clone(),
        operating_system: cli.os.clone(),
        settings,
        taint: !cli.disable_taint,
    };
    match cli.startup_timeout {
        Some(timeout) => tokio::time::timeout(timeout, k8s.register_node(&blueprint))
            .await
            .map_err(|_| VkError::StartupTimeout {
                name: blueprint.name.clone(),
                timeout,
            })??,
        None => k8s.register_node(&blueprint).await?,
    }

    provider.start();

    let cancel = CancellationToken::new();
    let tasks = TaskTracker::new();
    let k8s = Arc::new(k8s);

    {
        let k8s = k8s.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { k8s.heartbeat(blueprint, resync, cancel).await });
    }

    if let Some(path) = cli.metrics_file.clone() {
        let exporter = TextfileExporter::new(metrics.clone(), path);
        let cancel = cancel.clone();
        tasks.spawn(async move { exporter.run(resync, cancel).await });
    }

    let watcher = PodWatcher::new(k8s.client(), cli.nodename.clone(), provider.clone());
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = watcher.run(cancel).await {
                warn!("Pod watcher exited: {}", e);
            }
        });
    }

    info!("Node {} is running", cli.nodename);
    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    cancel.cancel();
    tasks.close();
    tasks.wait().await;
    provider.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_provider_config_merges_sources() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "unreachable_grace: 10m").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let cli = Cli::try_parse_from([
            "vk-apptainer",
            "--ssh-host",
            "login01",
            "--pod-sync-workers",
            "12",
            "--full-resync-period",
            "15s",
            "--config",
            path.as_str(),
        ])
        .unwrap();
        let settings = NodeSettings::from_lookup(|k| {
            (k == "VKUBELET_POD_IP").then(|| "10.1.1.1".to_string())
        })
        .unwrap();

        let config = provider_config(&cli, &settings).unwrap();

        assert_eq!(config.workers, 12);
        assert_eq!(config.resync_period, Duration::from_secs(15));
        assert_eq!(config.unreachable_grace, Duration::from_secs(600));
        assert_eq!(config.host_ip.as_deref(), Some("10.1.1.1"));
    }

    #[test]
    fn test_ssh_target_from_flags() {
        let cli = Cli::try_parse_from([
            "vk-apptainer",
            "--ssh-host",
            "login01",
            "--ssh-user",
            "svc-vk",
            "--ssh-port",
            "2222",
        ])
        .unwrap();
        let target = ssh_target(&cli);
        assert_eq!(target.user_at_host(), "svc-vk@login01");
        assert_eq!(target.port, 2222);
    }
}
