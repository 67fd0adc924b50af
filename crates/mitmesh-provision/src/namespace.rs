//! Namespace bootstrap: namespace, admin binding, permissive network policy

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::core::ObjectMeta;
use tracing::info;

use mitmesh_common::kube_utils::{managed_labels, Manifest};
use mitmesh_common::Error;

use crate::client::ClusterApi;
use crate::config::ProvisionConfig;
use crate::identity::{build_role_binding, ServiceIdentity};
use crate::Ensured;

/// Name of the default-allow NetworkPolicy
pub const ALLOW_ALL_POLICY_NAME: &str = "allow-all";

/// Namespace carrying only its name.
///
/// Applied with server-side apply, so labels and annotations owned by other
/// managers (mesh injection markers in particular) are left alone.
pub fn build_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Default-allow ingress and egress policy for every pod in `namespace`.
///
/// Some CNIs default-deny once any policy exists in a namespace; an explicit
/// allow-all is the baseline that mesh-specific policy narrows later.
pub fn build_permissive_network_policy(namespace: &str) -> Result<NetworkPolicy, Error> {
    let labels = managed_labels(ALLOW_ALL_POLICY_NAME);
    serde_json::from_value(serde_json::json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": {
            "name": ALLOW_ALL_POLICY_NAME,
            "namespace": namespace,
            "labels": labels,
        },
        "spec": {
            "podSelector": {},
            "policyTypes": ["Ingress", "Egress"],
            "ingress": [{}],
            "egress": [{}],
        }
    }))
    .map_err(|e| Error::serialization(format!("NetworkPolicy: {}", e)))
}

/// Creates the namespace and its baseline RBAC and network policy
pub struct NamespaceBootstrapper<'a> {
    cluster: &'a dyn ClusterApi,
    config: &'a ProvisionConfig,
}

impl<'a> NamespaceBootstrapper<'a> {
    /// Create a bootstrapper over the given cluster
    pub fn new(cluster: &'a dyn ClusterApi, config: &'a ProvisionConfig) -> Self {
        Self { cluster, config }
    }

    /// Create the namespace if absent.
    pub async fn ensure_namespace(&self, name: &str) -> Result<Ensured<String>, Error> {
        let outcome = self
            .cluster
            .apply(&Manifest::from_k8s(&build_namespace(name))?)
            .await?;
        info!(namespace = %name, %outcome, "ensured namespace");
        Ok(Ensured::new(name.to_string(), outcome))
    }

    /// Bind the namespace admin role to `identity` inside `namespace`.
    pub async fn ensure_admin_binding(
        &self,
        namespace: &str,
        identity: &ServiceIdentity,
    ) -> Result<(), Error> {
        let binding = build_role_binding(identity, &self.config.namespace_role, namespace);
        let outcome = self.cluster.apply(&Manifest::from_k8s(&binding)?).await?;
        info!(namespace = %namespace, identity = %identity, %outcome, "ensured namespace admin binding");
        Ok(())
    }

    /// Install the default-allow network policy in `namespace`.
    pub async fn apply_permissive_network_policy(&self, namespace: &str) -> Result<(), Error> {
        let policy = build_permissive_network_policy(namespace)?;
        let outcome = self.cluster.apply(&Manifest::from_k8s(&policy)?).await?;
        info!(namespace = %namespace, %outcome, "applied permissive network policy");
        Ok(())
    }
}
