//! mitmesh CLI
//!
//! Provisions a mitmproxy into the current GKE cluster and neutralizes the
//! namespace's service mesh.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mitmesh_cli::Cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli.run().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
