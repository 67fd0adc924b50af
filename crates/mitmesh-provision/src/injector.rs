//! Sidecar injection seam
//!
//! Linkerd's manual injection rewrites a workload so it carries the proxy
//! sidecar regardless of namespace annotations. The reconciler only sees the
//! [`SidecarInjector`] trait; [`LinkerdCli`] shells out to `linkerd inject`.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;

#[cfg(test)]
use mockall::automock;

use mitmesh_common::Error;

use crate::command;

/// Rewrites a deployment so its pods run with a mesh sidecar
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SidecarInjector: Send + Sync {
    /// Return the injected form of `deployment`
    async fn inject(&self, deployment: &Deployment) -> Result<Deployment, Error>;
}

/// [`SidecarInjector`] using `linkerd inject --manual`
pub struct LinkerdCli {
    binary: String,
}

impl LinkerdCli {
    /// Use the `linkerd` binary on `PATH`
    pub fn new() -> Self {
        Self {
            binary: "linkerd".to_string(),
        }
    }

    /// Use a specific linkerd binary
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for LinkerdCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SidecarInjector for LinkerdCli {
    async fn inject(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let input = serde_json::to_vec(deployment)
            .map_err(|e| Error::serialization(format!("deployment: {}", e)))?;
        let stdout = command::run_checked(
            &self.binary,
            &["inject", "--manual", "--output", "json", "-"],
            Some(&input),
        )
        .await?;
        serde_json::from_str(&stdout)
            .map_err(|e| Error::serialization(format!("linkerd inject output: {}", e)))
    }
}
