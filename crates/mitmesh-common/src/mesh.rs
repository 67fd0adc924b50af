//! Service mesh constants and the mesh classification enum
//!
//! Single source of truth for the namespace markers mitmesh reads and writes
//! when detecting and neutralizing Istio or Linkerd sidecar injection.

use std::fmt;

// =============================================================================
// Istio
// =============================================================================

/// Namespace label Istio's injector reads for default-revision injection.
pub const ISTIO_INJECTION_LABEL: &str = "istio-injection";

/// Namespace label selecting a named istiod revision (implies injection).
pub const ISTIO_REV_LABEL: &str = "istio.io/rev";

/// Label selector of the default Istio ingress gateway pods.
pub const ISTIO_INGRESS_SELECTOR_KEY: &str = "istio";

/// Value of [`ISTIO_INGRESS_SELECTOR_KEY`] on the default ingress gateway.
pub const ISTIO_INGRESS_SELECTOR_VALUE: &str = "ingressgateway";

// =============================================================================
// Linkerd
// =============================================================================

/// Namespace/pod annotation Linkerd's proxy injector reads.
pub const LINKERD_INJECT_ANNOTATION: &str = "linkerd.io/inject";

/// Container name Linkerd injects into pod templates.
pub const LINKERD_PROXY_CONTAINER: &str = "linkerd-proxy";

/// Linkerd-only injection value meaning "inject in ingress mode".
pub const LINKERD_INJECT_INGRESS: &str = "ingress";

// =============================================================================
// Shared values
// =============================================================================

/// Marker value enabling injection.
pub const INJECTION_ENABLED: &str = "enabled";

/// Marker value disabling injection.
pub const INJECTION_DISABLED: &str = "disabled";

/// Annotation recording which mesh mitmesh neutralized in a namespace.
///
/// Once injection is switched off the mesh markers no longer say which mesh
/// was present, so re-runs read this to re-apply the same policy set.
pub const NEUTRALIZED_MESH_ANNOTATION: &str = "mitmesh.io/neutralized-mesh";

// =============================================================================
// ServiceMeshKind
// =============================================================================

/// Ambient service mesh detected on a namespace.
///
/// Derived from live namespace metadata on every run, never stored locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceMeshKind {
    /// Istio sidecar injection
    Istio,
    /// Linkerd proxy injection
    Linkerd,
    /// No mesh injection
    None,
    /// Markers present but not classifiable
    Unknown,
}

impl ServiceMeshKind {
    /// Lowercase name, also the value of [`NEUTRALIZED_MESH_ANNOTATION`]
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceMeshKind::Istio => "istio",
            ServiceMeshKind::Linkerd => "linkerd",
            ServiceMeshKind::None => "none",
            ServiceMeshKind::Unknown => "unknown",
        }
    }

    /// Parse a neutralization record. Only real meshes are recorded.
    pub fn from_record(value: &str) -> Option<Self> {
        match value {
            "istio" => Some(ServiceMeshKind::Istio),
            "linkerd" => Some(ServiceMeshKind::Linkerd),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceMeshKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
