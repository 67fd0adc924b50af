//! Cluster context resolution
//!
//! GKE kube contexts are named `gke_<project>_<location>_<cluster>`. The
//! project, location and cluster are read from that name and cross-checked
//! against the active cloud session's project. Anything missing or
//! contradictory is an [`Error::UnresolvedContext`]: provisioning against a
//! guessed cluster is never attempted.

use std::fmt;

use tracing::{debug, info};

use mitmesh_common::Error;

use crate::session::CloudSession;

const GKE_CONTEXT_PREFIX: &str = "gke";

/// Resolved project, cluster and location for a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterContext {
    /// Cloud project id
    pub project_id: String,
    /// Cluster name
    pub cluster_name: String,
    /// Zone or region of the cluster
    pub cluster_location: String,
}

impl fmt::Display for ClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.project_id, self.cluster_location, self.cluster_name
        )
    }
}

impl ClusterContext {
    /// Parse a GKE kube context name.
    ///
    /// ```
    /// use mitmesh_provision::ClusterContext;
    ///
    /// let ctx = ClusterContext::parse_gke_context("gke_my-proj_us-central1-a_prod").unwrap();
    /// assert_eq!(ctx.project_id, "my-proj");
    /// assert_eq!(ctx.cluster_location, "us-central1-a");
    /// assert_eq!(ctx.cluster_name, "prod");
    /// ```
    pub fn parse_gke_context(context: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = context.split('_').collect();
        match parts.as_slice() {
            [GKE_CONTEXT_PREFIX, project, location, cluster]
                if !project.is_empty() && !location.is_empty() && !cluster.is_empty() =>
            {
                Ok(Self {
                    project_id: project.to_string(),
                    cluster_location: location.to_string(),
                    cluster_name: cluster.to_string(),
                })
            }
            _ => Err(Error::unresolved_context(format!(
                "kube context '{}' is not of the form gke_<project>_<location>_<cluster>",
                context
            ))),
        }
    }
}

/// Resolve the cluster context from the active session.
///
/// Performs no mutations. The session project wins when set; without one the
/// kube context's project is used. Disagreement between the two is rejected.
/// A session that cannot be queried at all (missing CLI, no credentials) is
/// unresolved as well.
pub async fn resolve(session: &dyn CloudSession) -> Result<ClusterContext, Error> {
    let kube_context = session
        .current_kube_context()
        .await
        .map_err(session_unavailable)?
        .ok_or_else(|| Error::unresolved_context("no active kube context"))?;
    let parsed = ClusterContext::parse_gke_context(&kube_context)?;

    let project = session.active_project().await.map_err(session_unavailable)?;
    debug!(%kube_context, project = ?project, "resolving cluster context");

    let context = match project {
        Some(project) if project != parsed.project_id => {
            return Err(Error::unresolved_context(format!(
                "active project '{}' does not match kube context project '{}'",
                project, parsed.project_id
            )));
        }
        Some(project) => ClusterContext {
            project_id: project,
            ..parsed
        },
        None => parsed,
    };
    info!(context = %context, "resolved cluster context");
    Ok(context)
}

fn session_unavailable(e: Error) -> Error {
    Error::unresolved_context(format!("cloud session unavailable: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MockCloudSession;

    fn session(context: Option<&str>, project: Option<&str>) -> MockCloudSession {
        let context = context.map(str::to_string);
        let project = project.map(str::to_string);
        let mut mock = MockCloudSession::new();
        mock.expect_current_kube_context()
            .returning(move || Ok(context.clone()));
        mock.expect_active_project()
            .returning(move || Ok(project.clone()));
        // Resolution must never touch IAM
        mock.expect_create_service_account().never();
        mock.expect_add_project_binding().never();
        mock
    }

    #[tokio::test]
    async fn resolves_matching_session() {
        let ctx = resolve(&session(Some("gke_proj-1_europe-west1_edge"), Some("proj-1")))
            .await
            .unwrap();
        assert_eq!(
            ctx,
            ClusterContext {
                project_id: "proj-1".to_string(),
                cluster_name: "edge".to_string(),
                cluster_location: "europe-west1".to_string(),
            }
        );
        assert_eq!(ctx.to_string(), "proj-1/europe-west1/edge");
    }

    #[tokio::test]
    async fn missing_context_fails_closed() {
        let err = resolve(&session(None, Some("proj-1"))).await.unwrap_err();
        assert!(matches!(err, Error::UnresolvedContext { .. }));
    }

    #[tokio::test]
    async fn missing_project_falls_back_to_context() {
        let ctx = resolve(&session(Some("gke_proj-1_us-east1_a"), None))
            .await
            .unwrap();
        assert_eq!(ctx.project_id, "proj-1");
    }

    #[tokio::test]
    async fn project_mismatch_fails_closed() {
        let err = resolve(&session(Some("gke_proj-1_us-east1_a"), Some("proj-2")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[tokio::test]
    async fn unusable_session_is_unresolved() {
        let mut mock = MockCloudSession::new();
        mock.expect_current_kube_context()
            .returning(|| Ok(Some("gke_proj-1_us-central1_edge".to_string())));
        mock.expect_active_project().returning(|| {
            Err(Error::command_failed(
                "gcloud config get-value project",
                "No such file or directory (os error 2)",
            ))
        });
        mock.expect_create_service_account().never();
        mock.expect_add_project_binding().never();

        let err = resolve(&mock).await.unwrap_err();
        match err {
            Error::UnresolvedContext { message } => {
                assert!(message.contains("cloud session unavailable"));
                assert!(message.contains("os error 2"));
            }
            other => panic!("expected unresolved context, got {other}"),
        }
    }

    #[test]
    fn non_gke_contexts_are_rejected() {
        for ctx in [
            "kind-dev",
            "gke_proj_zone",
            "gke_proj_zone_cluster_extra",
            "gke__zone_cluster",
            "eks_proj_zone_cluster",
        ] {
            assert!(
                ClusterContext::parse_gke_context(ctx).is_err(),
                "{ctx} should not parse"
            );
        }
    }
}
