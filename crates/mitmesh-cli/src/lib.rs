//! mitmesh CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// mitmesh - Provision a mitmproxy into a GKE cluster, whatever mesh it runs
#[derive(Parser, Debug)]
#[command(name = "mitmesh")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Defaults to `up`
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Flags accepted by every subcommand
#[derive(Args, Debug, Default, Clone)]
pub struct GlobalArgs {
    /// YAML file overriding provisioning defaults
    #[arg(long, global = true, env = "MITMESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Namespace for the proxy and its clients
    #[arg(long, short = 'n', global = true)]
    pub namespace: Option<String>,

    /// Kubeconfig to use instead of the default chain
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Where to write the proxy CA certificate
    #[arg(long, global = true)]
    pub ca_output: Option<PathBuf>,

    /// How long to wait for the proxy CA to appear
    #[arg(long, global = true)]
    pub trust_timeout_secs: Option<u64>,
}

/// Subcommands; a bare invocation runs `up`
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full provisioning sequence
    Up,
    /// Print the service mesh detected in the namespace
    Detect,
    /// Print the manifests a run would apply, without touching the cluster
    Render(commands::render::RenderArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let config = config::build_config(&self.global)?;
        let kubeconfig = config::resolve_kubeconfig(self.global.kubeconfig.as_deref());
        let kubeconfig = kubeconfig.as_deref();
        match self.command.unwrap_or(Commands::Up) {
            Commands::Up => commands::up::run(config, kubeconfig).await,
            Commands::Detect => commands::detect::run(&config, kubeconfig).await,
            Commands::Render(args) => commands::render::run(args, &config),
        }
    }
}
