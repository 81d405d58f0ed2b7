use clap::Parser;
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vk_apptainer::cli::{commands, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting vk-apptainer v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = commands::run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
