//! Runtime configuration
//!
//! Three sources feed the daemon: command-line flags, the environment
//! variables a virtual kubelet is conventionally deployed with, and an
//! optional YAML file with engine tuning.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use vk_apptainer_provider::{ProviderConfig, RetryPolicy};

use crate::{Result, VkError};

pub const DEFAULT_KUBELET_PORT: i32 = 10250;
pub const DEFAULT_TAINT_KEY: &str = "virtual-kubelet.io/provider";
pub const DEFAULT_TAINT_VALUE: &str = "apptainer";
pub const DEFAULT_TAINT_EFFECT: &str = "NoSchedule";

/// Parse `<n>ms`, `<n>s`, `<n>m` or `<n>h`; a bare number is seconds
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {:?}", s))?;

    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        other => Err(format!("unknown duration unit {:?} in {:?}", other, s)),
    }
}

fn duration_field(name: &str, value: &Option<String>) -> Result<Option<Duration>> {
    value
        .as_deref()
        .map(|v| parse_duration(v).map_err(|e| VkError::ConfigError(format!("{}: {}", name, e))))
        .transpose()
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryFile {
    pub max_attempts: Option<u32>,
    pub initial_backoff: Option<String>,
    pub max_backoff: Option<String>,
}

/// Engine tuning read from `--config`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TuningFile {
    pub retry: Option<RetryFile>,
    pub op_timeout: Option<String>,
    pub status_timeout: Option<String>,
    pub notify_timeout: Option<String>,
    pub unreachable_grace: Option<String>,
    pub terminated_retention: Option<String>,
    pub reconcile_concurrency: Option<usize>,
}

impl TuningFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VkError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| VkError::ConfigError(e.to_string()))
    }

    /// Overlay the fields present in the file
    pub fn apply(&self, config: &mut ProviderConfig) -> Result<()> {
        if let Some(retry) = &self.retry {
            let current = config.retry.clone();
            config.retry = RetryPolicy::new(
                retry.max_attempts.unwrap_or(current.max_attempts),
                duration_field("retry.initial_backoff", &retry.initial_backoff)?
                    .unwrap_or(current.initial_backoff),
                duration_field("retry.max_backoff", &retry.max_backoff)?
                    .unwrap_or(current.max_backoff),
            );
        }
        if let Some(d) = duration_field("op_timeout", &self.op_timeout)? {
            config.op_timeout = d;
        }
        if let Some(d) = duration_field("status_timeout", &self.status_timeout)? {
            config.status_timeout = d;
        }
        if let Some(d) = duration_field("notify_timeout", &self.notify_timeout)? {
            config.notify_timeout = d;
        }
        if let Some(d) = duration_field("unreachable_grace", &self.unreachable_grace)? {
            config.unreachable_grace = d;
        }
        if let Some(d) = duration_field("terminated_retention", &self.terminated_retention)? {
            config.terminated_retention = d;
        }
        if let Some(n) = self.reconcile_concurrency {
            if n == 0 {
                return Err(VkError::ConfigError(
                    "reconcile_concurrency must be at least 1".to_string(),
                ));
            }
            config.reconcile_concurrency = n;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaintSettings {
    pub key: String,
    pub value: String,
    pub effect: String,
}

/// Resources advertised by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub cpu: String,
    pub memory: String,
    pub pods: String,
    pub gpu: Option<String>,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            cpu: "64".to_string(),
            memory: "512Gi".to_string(),
            pods: "640".to_string(),
            gpu: None,
        }
    }
}

/// Node facts taken from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub kubelet_port: i32,
    pub pod_ip: Option<String>,
    pub taint: TaintSettings,
    pub quota: Quota,
}

impl NodeSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let kubelet_port = match var("KUBELET_PORT") {
            Some(port) => port
                .parse()
                .map_err(|_| VkError::ConfigError(format!("KUBELET_PORT {:?} is not a port", port)))?,
            None => DEFAULT_KUBELET_PORT,
        };

        let effect = var("VKUBELET_TAINT_EFFECT").unwrap_or_else(|| DEFAULT_TAINT_EFFECT.to_string());
        if !matches!(effect.as_str(), "NoSchedule" | "NoExecute" | "PreferNoSchedule") {
            return Err(VkError::UnsupportedTaintEffect(effect));
        }

        let defaults = Quota::default();
        let quota = Quota {
            cpu: var("APPTAINER_QUOTA_CPU").unwrap_or(defaults.cpu),
            memory: var("APPTAINER_QUOTA_MEMORY").unwrap_or(defaults.memory),
            pods: var("APPTAINER_QUOTA_POD").unwrap_or(defaults.pods),
            gpu: var("APPTAINER_QUOTA_GPU"),
        };

        Ok(Self {
            kubelet_port,
            pod_ip: var("VKUBELET_POD_IP"),
            taint: TaintSettings {
                key: var("VKUBELET_TAINT_KEY").unwrap_or_else(|| DEFAULT_TAINT_KEY.to_string()),
                value: var("VKUBELET_TAINT_VALUE").unwrap_or_else(|| DEFAULT_TAINT_VALUE.to_string()),
                effect,
            },
            quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("60s"), Ok(Duration::from_secs(60)));
        assert_eq!(parse_duration("3m"), Ok(Duration::from_secs(180)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_env_defaults() {
        let settings = NodeSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.kubelet_port, 10250);
        assert_eq!(settings.pod_ip, None);
        assert_eq!(settings.taint.key, "virtual-kubelet.io/provider");
        assert_eq!(settings.taint.value, "apptainer");
        assert_eq!(settings.taint.effect, "NoSchedule");
        assert_eq!(settings.quota, Quota::default());
    }

    #[test]
    fn test_env_overrides() {
        let settings = NodeSettings::from_lookup(lookup(&[
            ("KUBELET_PORT", "10260"),
            ("VKUBELET_POD_IP", "192.168.1.20"),
            ("VKUBELET_TAINT_EFFECT", "NoExecute"),
            ("APPTAINER_QUOTA_CPU", "128"),
            ("APPTAINER_QUOTA_GPU", "8"),
        ]))
        .unwrap();
        assert_eq!(settings.kubelet_port, 10260);
        assert_eq!(settings.pod_ip.as_deref(), Some("192.168.1.20"));
        assert_eq!(settings.taint.effect, "NoExecute");
        assert_eq!(settings.quota.cpu, "128");
        assert_eq!(settings.quota.gpu.as_deref(), Some("8"));
        assert_eq!(settings.quota.memory, "512Gi");
    }

    #[test]
    fn test_bad_env_is_rejected() {
        assert!(matches!(
            NodeSettings::from_lookup(lookup(&[("VKUBELET_TAINT_EFFECT", "Sometimes")])),
            Err(VkError::UnsupportedTaintEffect(_))
        ));
        assert!(matches!(
            NodeSettings::from_lookup(lookup(&[("KUBELET_PORT", "http")])),
            Err(VkError::ConfigError(_))
        ));
    }

    #[test]
    fn test_tuning_file_overlays_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "retry:\n  max_attempts: 7\n  initial_backoff: 500ms\nop_timeout: 2m\nreconcile_concurrency: 16"
        )
        .unwrap();

        let tuning = TuningFile::load(file.path()).unwrap();
        let mut config = ProviderConfig::default();
        tuning.apply(&mut config).unwrap();

        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.retry.max_backoff, RetryPolicy::default().max_backoff);
        assert_eq!(config.op_timeout, Duration::from_secs(120));
        assert_eq!(config.reconcile_concurrency, 16);
        assert_eq!(config.notify_timeout, ProviderConfig::default().notify_timeout);
    }

    #[test]
    fn test_tuning_file_rejects_unknown_fields() {
        assert!(TuningFile::parse("workers_per_pod: 3").is_err());
        assert!(TuningFile::parse("").unwrap() == TuningFile::default());
    }

    #[test]
    fn test_tuning_file_rejects_bad_duration() {
        let tuning = TuningFile::parse("notify_timeout: fast").unwrap();
        assert!(tuning.apply(&mut ProviderConfig::default()).is_err());
    }
}
