use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tuning knobs of the lifecycle engine
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Upper bound on concurrently executing pod operations
    pub workers: usize,
    /// Interval of the full status resync
    pub resync_period: Duration,
    /// Deadline for start/stop/update calls
    pub op_timeout: Duration,
    /// Deadline for a single status poll
    pub status_timeout: Duration,
    /// Deadline for a single notification
    pub notify_timeout: Duration,
    /// How long a backend may stay unreachable before the pod fails
    pub unreachable_grace: Duration,
    /// How long acknowledged terminated records are kept
    pub terminated_retention: Duration,
    /// Concurrent status polls per resync pass
    pub reconcile_concurrency: usize,
    pub retry: RetryPolicy,
    /// Reported as `hostIP`/`podIP` of every pod
    pub host_ip: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            workers: 50,
            resync_period: Duration::from_secs(60),
            op_timeout: Duration::from_secs(300),
            status_timeout: Duration::from_secs(30),
            notify_timeout: Duration::from_secs(10),
            unreachable_grace: Duration::from_secs(180),
            terminated_retention: Duration::from_secs(300),
            reconcile_concurrency: 8,
            retry: RetryPolicy::default(),
            host_ip: None,
        }
    }
}
