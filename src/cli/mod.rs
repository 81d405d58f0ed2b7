pub mod commands;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::parse_duration;

#[derive(Parser, Debug)]
#[command(name = "vk-apptainer")]
#[command(author = "batx-dev")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Implements a node on a Kubernetes cluster using Apptainer to run pods",
    long_about = None
)]
pub struct Cli {
    #[arg(long, default_value = "vk-apptainer", help = "Kubernetes node name")]
    pub nodename: String,

    #[arg(
        long,
        value_parser = parse_duration,
        help = "How long to wait for the node to register"
    )]
    pub startup_timeout: Option<Duration>,

    #[arg(long, help = "Disable the node taint")]
    pub disable_taint: bool,

    #[arg(long, default_value = "Linux", help = "Operating system (Linux/Windows)")]
    pub os: String,

    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    #[arg(
        long,
        default_value_t = 50,
        help = "Number of pod synchronization workers"
    )]
    pub pod_sync_workers: usize,

    #[arg(
        long,
        value_parser = parse_duration,
        default_value = "60s",
        help = "How often to perform a full resync of pods between Kubernetes and the provider"
    )]
    pub full_resync_period: Duration,

    #[arg(long, env = "KUBECONFIG", help = "Path to a kubeconfig file")]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, help = "YAML file with engine tuning")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "VK_APPTAINER_SSH_HOST", help = "Login node running Apptainer")]
    pub ssh_host: String,

    #[arg(long, env = "VK_APPTAINER_SSH_USER", help = "SSH user on the login node")]
    pub ssh_user: Option<String>,

    #[arg(long, default_value_t = 22, help = "SSH port of the login node")]
    pub ssh_port: u16,

    #[arg(long, help = "SSH private key")]
    pub ssh_key: Option<PathBuf>,

    #[arg(long, default_value = "apptainer", help = "Apptainer binary on the login node")]
    pub apptainer_bin: String,

    #[arg(long, help = "Write Prometheus metrics to this file every resync period")]
    pub metrics_file: Option<PathBuf>,
}
