//! CLI commands

use std::path::Path;

use mitmesh_common::kube_utils::create_client;
use mitmesh_provision::KubeClusterApi;

use crate::Result;

pub mod detect;
pub mod render;
pub mod up;

/// Cluster seam over the resolved kubeconfig
pub(crate) async fn connect(kubeconfig: Option<&Path>) -> Result<KubeClusterApi> {
    let client = create_client(kubeconfig).await?;
    Ok(KubeClusterApi::new(client))
}
