//! Mesh classification from namespace metadata
//!
//! Markers read:
//! - `istio-injection` label (`enabled` / `disabled`), which overrides
//! - `istio.io/rev` label (any non-empty revision means injection)
//! - `linkerd.io/inject` annotation (`enabled` / `ingress` / `disabled`)
//! - `mitmesh.io/neutralized-mesh` annotation, written by the reconciler
//!
//! Precedence: a malformed marker is `Unknown`; enabled Istio wins over
//! enabled Linkerd; a neutralization record is only consulted when no mesh
//! is actively injecting.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use tracing::{debug, warn};

use mitmesh_common::mesh::{
    ServiceMeshKind, INJECTION_DISABLED, INJECTION_ENABLED, ISTIO_INJECTION_LABEL,
    ISTIO_REV_LABEL, LINKERD_INJECT_ANNOTATION, LINKERD_INJECT_INGRESS,
    NEUTRALIZED_MESH_ANNOTATION,
};
use mitmesh_common::Error;

use crate::client::ClusterApi;

/// Injection state a single mesh's markers express
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Marker {
    Absent,
    Enabled,
    Disabled,
    Malformed,
}

impl Marker {
    fn enabled(self) -> bool {
        self == Marker::Enabled
    }
}

fn istio_marker(labels: &BTreeMap<String, String>) -> Marker {
    match labels.get(ISTIO_INJECTION_LABEL).map(String::as_str) {
        Some(INJECTION_ENABLED) => Marker::Enabled,
        Some(INJECTION_DISABLED) => Marker::Disabled,
        Some(_) => Marker::Malformed,
        None => match labels.get(ISTIO_REV_LABEL) {
            Some(rev) if rev.trim().is_empty() => Marker::Malformed,
            Some(_) => Marker::Enabled,
            None => Marker::Absent,
        },
    }
}

fn linkerd_marker(annotations: &BTreeMap<String, String>) -> Marker {
    match annotations.get(LINKERD_INJECT_ANNOTATION).map(String::as_str) {
        Some(INJECTION_ENABLED) | Some(LINKERD_INJECT_INGRESS) => Marker::Enabled,
        Some(INJECTION_DISABLED) => Marker::Disabled,
        Some(_) => Marker::Malformed,
        None => Marker::Absent,
    }
}

/// Classify namespace labels and annotations.
pub fn classify(
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> ServiceMeshKind {
    let istio = istio_marker(labels);
    let linkerd = linkerd_marker(annotations);

    if istio == Marker::Malformed || linkerd == Marker::Malformed {
        return ServiceMeshKind::Unknown;
    }

    if istio.enabled() {
        if linkerd.enabled() {
            warn!("namespace enables both Istio and Linkerd injection; treating as Istio");
        }
        return ServiceMeshKind::Istio;
    }
    if linkerd.enabled() {
        return ServiceMeshKind::Linkerd;
    }

    match annotations.get(NEUTRALIZED_MESH_ANNOTATION) {
        Some(record) => ServiceMeshKind::from_record(record).unwrap_or(ServiceMeshKind::Unknown),
        None => ServiceMeshKind::None,
    }
}

/// Classify a namespace object.
pub fn detect(namespace: &Namespace) -> ServiceMeshKind {
    let empty = BTreeMap::new();
    let labels = namespace.metadata.labels.as_ref().unwrap_or(&empty);
    let annotations = namespace.metadata.annotations.as_ref().unwrap_or(&empty);
    classify(labels, annotations)
}

/// Reads live namespace metadata and classifies it
pub struct MeshDetector<'a> {
    cluster: &'a dyn ClusterApi,
}

impl<'a> MeshDetector<'a> {
    /// Create a detector over the given cluster
    pub fn new(cluster: &'a dyn ClusterApi) -> Self {
        Self { cluster }
    }

    /// Classify the mesh of namespace `name`. A missing namespace has no mesh.
    pub async fn detect(&self, name: &str) -> Result<ServiceMeshKind, Error> {
        let kind = match self.cluster.get_namespace(name).await? {
            Some(namespace) => detect(&namespace),
            None => ServiceMeshKind::None,
        };
        debug!(namespace = %name, mesh = %kind, "detected service mesh");
        Ok(kind)
    }
}
