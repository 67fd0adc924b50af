//! Service identity provisioning and role binding
//!
//! The proxy runs with a Google service account that is deliberately granted
//! cluster-admin equivalent rights: interception needs to read and rewrite
//! arbitrary workloads. This is an accepted over-grant, not a boundary
//! mitmesh enforces.

use std::fmt;

use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use kube::core::ObjectMeta;
use tracing::{debug, info};

use mitmesh_common::kube_utils::{managed_labels, Manifest};
use mitmesh_common::Error;

use crate::client::ClusterApi;
use crate::config::ProvisionConfig;
use crate::context::ClusterContext;
use crate::session::CloudSession;
use crate::{Ensured, Outcome};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const SERVICE_ACCOUNT_DISPLAY_NAME: &str = "mitmproxy interception proxy";

/// A cloud service account principal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// Account id (the part before `@`)
    pub name: String,
    /// Owning project
    pub project_id: String,
}

impl ServiceIdentity {
    /// Full account email, the principal name Kubernetes RBAC sees
    pub fn email(&self) -> String {
        format!("{}@{}.iam.gserviceaccount.com", self.name, self.project_id)
    }

    /// IAM member string for project policy bindings
    pub fn iam_member(&self) -> String {
        format!("serviceAccount:{}", self.email())
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.email())
    }
}

/// Where a role is granted
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoleScope {
    /// IAM policy binding on a cloud project
    Project(String),
    /// Cluster-wide `ClusterRoleBinding`
    Cluster,
    /// `RoleBinding` inside one namespace
    Namespace(String),
}

/// Deterministic binding object name for an `(identity, role)` pair.
///
/// Re-binding the same tuple always targets the same object. The last path
/// segment of the role is folded into a DNS-1123 label: lowercased, every
/// other character run replaced by a single `-`.
///
/// ```
/// use mitmesh_provision::identity::{binding_name, ServiceIdentity};
///
/// let identity = ServiceIdentity {
///     name: "mitmproxy-admin".to_string(),
///     project_id: "proj-1".to_string(),
/// };
/// assert_eq!(
///     binding_name(&identity, "system:aggregate-to-admin"),
///     "mitmproxy-admin-system-aggregate-to-admin"
/// );
/// ```
pub fn binding_name(identity: &ServiceIdentity, role: &str) -> String {
    let role = role.rsplit('/').next().unwrap_or(role);
    let mut suffix = String::with_capacity(role.len());
    for c in role.chars().map(|c| c.to_ascii_lowercase()) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            suffix.push(c);
        } else if !suffix.is_empty() && !suffix.ends_with('-') {
            suffix.push('-');
        }
    }
    let suffix = suffix.trim_end_matches('-');
    if suffix.is_empty() {
        identity.name.clone()
    } else {
        format!("{}-{}", identity.name, suffix)
    }
}

fn user_subject(identity: &ServiceIdentity) -> Subject {
    Subject {
        api_group: Some(RBAC_API_GROUP.to_string()),
        kind: "User".to_string(),
        name: identity.email(),
        namespace: None,
    }
}

fn cluster_role_ref(role: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name: role.to_string(),
    }
}

/// ClusterRoleBinding granting `role` cluster-wide
pub fn build_cluster_role_binding(identity: &ServiceIdentity, role: &str) -> ClusterRoleBinding {
    let name = binding_name(identity, role);
    ClusterRoleBinding {
        metadata: ObjectMeta {
            labels: Some(managed_labels(&name)),
            name: Some(name),
            ..Default::default()
        },
        role_ref: cluster_role_ref(role),
        subjects: Some(vec![user_subject(identity)]),
    }
}

/// RoleBinding granting ClusterRole `role` inside `namespace`
pub fn build_role_binding(identity: &ServiceIdentity, role: &str, namespace: &str) -> RoleBinding {
    let name = binding_name(identity, role);
    RoleBinding {
        metadata: ObjectMeta {
            labels: Some(managed_labels(&name)),
            name: Some(name),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        role_ref: cluster_role_ref(role),
        subjects: Some(vec![user_subject(identity)]),
    }
}

/// Creates the service identity and binds roles to it
pub struct IdentityProvisioner<'a> {
    session: &'a dyn CloudSession,
    cluster: &'a dyn ClusterApi,
    config: &'a ProvisionConfig,
}

impl<'a> IdentityProvisioner<'a> {
    /// Create a provisioner over the given seams
    pub fn new(
        session: &'a dyn CloudSession,
        cluster: &'a dyn ClusterApi,
        config: &'a ProvisionConfig,
    ) -> Self {
        Self {
            session,
            cluster,
            config,
        }
    }

    /// Create the service account if absent.
    ///
    /// An "already exists" conflict is the `Existing` outcome, never an error.
    pub async fn ensure_identity(
        &self,
        context: &ClusterContext,
    ) -> Result<Ensured<ServiceIdentity>, Error> {
        let identity = ServiceIdentity {
            name: self.config.identity_name.clone(),
            project_id: context.project_id.clone(),
        };

        let outcome = match self
            .session
            .create_service_account(
                &identity.project_id,
                &identity.name,
                SERVICE_ACCOUNT_DISPLAY_NAME,
            )
            .await
        {
            Ok(()) => Outcome::Created,
            Err(e) if e.is_conflict() => Outcome::Existing,
            Err(e) => return Err(e),
        };

        info!(identity = %identity, %outcome, "ensured service identity");
        Ok(Ensured::new(identity, outcome))
    }

    /// Bind `role` to `identity` at `scope`. Rebinding is a no-op.
    pub async fn bind_role(
        &self,
        identity: &ServiceIdentity,
        role: &str,
        scope: &RoleScope,
    ) -> Result<(), Error> {
        match scope {
            RoleScope::Project(project) => {
                self.session
                    .add_project_binding(project, &identity.iam_member(), role)
                    .await?;
            }
            RoleScope::Cluster => {
                let manifest = Manifest::from_k8s(&build_cluster_role_binding(identity, role))?;
                let outcome = self.cluster.apply(&manifest).await?;
                debug!(binding = %manifest.key(), %outcome, "cluster role binding");
            }
            RoleScope::Namespace(namespace) => {
                let manifest =
                    Manifest::from_k8s(&build_role_binding(identity, role, namespace))?;
                let outcome = self.cluster.apply(&manifest).await?;
                debug!(binding = %manifest.key(), %outcome, "namespace role binding");
            }
        }
        info!(identity = %identity, role, scope = ?scope, "bound role");
        Ok(())
    }
}
