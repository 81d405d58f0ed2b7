//! Virtual kubelet running pods as Apptainer instances on a remote host
//!
//! Responsibilities:
//! - Register and heartbeat a virtual node
//! - Watch pods bound to the node and feed them to the lifecycle engine
//! - Patch pod status back to the API server
//! - Export engine metrics in Prometheus text format

pub mod cli;
pub mod config;
pub mod error;
pub mod k8s;
pub mod metrics;

pub use error::{Result, VkError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
