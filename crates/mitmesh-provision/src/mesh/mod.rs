//! Service mesh detection and neutralization
//!
//! A sidecar injected in front of mitmproxy would intercept or bypass the
//! traffic the proxy is meant to see. [`detector`] classifies the proxy
//! namespace from its live metadata; [`reconciler`] applies the policy set
//! for that classification.

pub mod detector;
pub mod reconciler;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::core::ObjectMeta;

use mitmesh_common::kube_utils::Manifest;
use mitmesh_common::policy::{AuthorizationPolicy, Gateway, VirtualService};
use mitmesh_common::Error;

pub use detector::{classify, MeshDetector};
pub use mitmesh_common::mesh::ServiceMeshKind;
pub use reconciler::MeshPolicyReconciler;

/// Labels and annotations merged into the proxy namespace
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespacePatch {
    /// Labels to set
    pub labels: BTreeMap<String, String>,
    /// Annotations to set
    pub annotations: BTreeMap<String, String>,
}

impl NamespacePatch {
    /// The patch as a partial Namespace object, for display
    pub fn to_namespace(&self, name: &str) -> Namespace {
        let non_empty = |map: &BTreeMap<String, String>| (!map.is_empty()).then(|| map.clone());
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: non_empty(&self.labels),
                annotations: non_empty(&self.annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Objects that neutralize one mesh in the proxy namespace.
///
/// Every application is a full overwrite; nothing is diffed against a
/// previous run.
#[derive(Clone, Debug, PartialEq)]
pub enum MeshPolicySet {
    /// Injection disabled, mesh ingress routed to the proxy, traffic allowed
    Istio {
        /// `istio-injection=disabled` plus the neutralization record
        namespace_patch: NamespacePatch,
        /// Gateway bound to the mesh ingress
        gateway: Gateway,
        /// Routes every path to the proxy service
        virtual_service: VirtualService,
        /// Allows all traffic to the proxy
        authorization_policy: AuthorizationPolicy,
    },
    /// Injection disabled, proxy deployment re-injected explicitly
    Linkerd {
        /// `linkerd.io/inject=disabled` plus the neutralization record
        namespace_patch: NamespacePatch,
        /// Proxy deployment with the sidecar in its pod template
        deployment: Box<Deployment>,
    },
    /// No mesh: nothing to apply
    Empty,
}

impl MeshPolicySet {
    /// Mesh this set neutralizes, `None` for the empty set
    pub fn kind(&self) -> ServiceMeshKind {
        match self {
            MeshPolicySet::Istio { .. } => ServiceMeshKind::Istio,
            MeshPolicySet::Linkerd { .. } => ServiceMeshKind::Linkerd,
            MeshPolicySet::Empty => ServiceMeshKind::None,
        }
    }

    /// Namespace patch, if any
    pub fn namespace_patch(&self) -> Option<&NamespacePatch> {
        match self {
            MeshPolicySet::Istio {
                namespace_patch, ..
            }
            | MeshPolicySet::Linkerd {
                namespace_patch, ..
            } => Some(namespace_patch),
            MeshPolicySet::Empty => None,
        }
    }

    /// Objects to server-side apply, in order
    pub fn manifests(&self) -> Result<Vec<Manifest>, Error> {
        match self {
            MeshPolicySet::Istio {
                gateway,
                virtual_service,
                authorization_policy,
                ..
            } => Ok(vec![
                Manifest::from_crd(
                    &gateway.metadata.name,
                    &gateway.metadata.namespace,
                    gateway,
                )?,
                Manifest::from_crd(
                    &virtual_service.metadata.name,
                    &virtual_service.metadata.namespace,
                    virtual_service,
                )?,
                Manifest::from_crd(
                    &authorization_policy.metadata.name,
                    &authorization_policy.metadata.namespace,
                    authorization_policy,
                )?,
            ]),
            MeshPolicySet::Linkerd { deployment, .. } => {
                Ok(vec![Manifest::from_k8s(deployment.as_ref())?])
            }
            MeshPolicySet::Empty => Ok(Vec::new()),
        }
    }
}
