//! Shared types between the lifecycle engine and the Kubernetes glue
//!
//! This crate defines the vocabulary every other crate speaks:
//! - `PodIdentity` keys every record
//! - `LifecycleState` is the cached state machine of a pod
//! - `RemoteHandle` / `RemoteStatus` / `ExitInfo` describe a backend instance

use std::fmt;

/// Stable key of a pod: namespace plus name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
}

impl PodIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Cached lifecycle state of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Pending,
    Creating,
    Running,
    Updating,
    Terminating,
    Terminated,
    Failed,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 7] = [
        LifecycleState::Pending,
        LifecycleState::Creating,
        LifecycleState::Running,
        LifecycleState::Updating,
        LifecycleState::Terminating,
        LifecycleState::Terminated,
        LifecycleState::Failed,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Creating => "creating",
            LifecycleState::Running => "running",
            LifecycleState::Updating => "updating",
            LifecycleState::Terminating => "terminating",
            LifecycleState::Terminated => "terminated",
            LifecycleState::Failed => "failed",
        }
    }

    /// No further backend-driven transition is expected
    pub const fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Terminated | LifecycleState::Failed)
    }

    /// States in which a record is allowed to hold a remote handle
    pub const fn holds_handle(&self) -> bool {
        matches!(
            self,
            LifecycleState::Creating
                | LifecycleState::Running
                | LifecycleState::Updating
                | LifecycleState::Terminating
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to a running backend instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteHandle(String);

impl RemoteHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a remote process finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the backend lost track of the process
    pub code: Option<i32>,
    pub reason: String,
}

impl ExitInfo {
    pub fn with_code(code: i32) -> Self {
        let reason = if code == 0 { "Completed" } else { "Error" };
        Self {
            code: Some(code),
            reason: reason.to_string(),
        }
    }

    pub fn lost(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.code == Some(0)
    }
}

/// What the backend reports for a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Running,
    Exited(ExitInfo),
    Unreachable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = LifecycleState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![&LifecycleState::Terminated, &LifecycleState::Failed]
        );
    }

    #[test]
    fn test_handle_states_exclude_terminal() {
        for state in LifecycleState::ALL {
            if state.is_terminal() || state == LifecycleState::Pending {
                assert!(!state.holds_handle(), "{} must not hold a handle", state);
            }
        }
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(PodIdentity::new("default", "nginx").to_string(), "default/nginx");
    }

    #[test]
    fn test_exit_info() {
        assert!(ExitInfo::with_code(0).succeeded());
        assert_eq!(ExitInfo::with_code(137).reason, "Error");
        assert!(!ExitInfo::lost("InstanceNotFound").succeeded());
    }
}
