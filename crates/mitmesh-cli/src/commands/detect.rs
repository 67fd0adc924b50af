//! Detect command

use std::path::Path;

use mitmesh_provision::mesh::MeshDetector;
use mitmesh_provision::ProvisionConfig;

use crate::Result;

/// Print the mesh kind of the configured namespace
pub async fn run(config: &ProvisionConfig, kubeconfig: Option<&Path>) -> Result<()> {
    let cluster = super::connect(kubeconfig).await?;
    let kind = MeshDetector::new(&cluster).detect(&config.namespace).await?;
    println!("{}", kind);
    Ok(())
}
