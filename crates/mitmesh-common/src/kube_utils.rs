//! Shared Kubernetes utilities using kube-rs
//!
//! Everything mitmesh writes to the cluster goes through a [`Manifest`]: a
//! serialized object plus the `ApiResource` needed to server-side apply it.
//! Typed k8s-openapi objects and the hand-written Istio types both convert
//! into one, so the apply path is the same for native kinds and CRDs.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config, Resource, ResourceExt};
use serde::Serialize;
use tracing::trace;

use crate::Error;

// =============================================================================
// ObjectMeta - metadata for hand-written CRD types
// =============================================================================

/// Kubernetes metadata for the Istio resource types.
///
/// Automatically adds mitmesh management labels on construction.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create new metadata with standard mitmesh labels
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            labels: managed_labels(&name),
            name,
            namespace: namespace.into(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Standard labels stamped on every object mitmesh creates.
pub fn managed_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (crate::LABEL_NAME.to_string(), name.to_string()),
        (
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_MITMESH.to_string(),
        ),
    ])
}

/// Render a label map as a `k=v,k2=v2` selector string.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// # Example
/// ```ignore
/// impl HasApiResource for AuthorizationPolicy {
///     const API_VERSION: &'static str = "security.istio.io/v1";
///     const KIND: &'static str = "AuthorizationPolicy";
/// }
///
/// let ar = AuthorizationPolicy::api_resource();
/// ```
pub trait HasApiResource {
    /// Full API version (e.g., "security.istio.io/v1", "v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "AuthorizationPolicy")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use mitmesh_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("networking.istio.io/v1beta1");
/// assert_eq!(group, "networking.istio.io");
/// assert_eq!(version, "v1beta1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

// =============================================================================
// Manifest - a single object ready for server-side apply
// =============================================================================

/// A serialized Kubernetes object plus the coordinates needed to apply it.
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    /// API coordinates (group/version/kind/plural)
    pub api_resource: ApiResource,
    /// Object name
    pub name: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Full object body including apiVersion and kind
    pub body: serde_json::Value,
}

impl Manifest {
    /// Build a manifest from a typed k8s-openapi object.
    pub fn from_k8s<K>(resource: &K) -> Result<Self, Error>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let api_resource = ApiResource::erase::<K>(&());
        let name = resource.meta().name.clone().ok_or_else(|| {
            Error::serialization(format!("{} is missing metadata.name", api_resource.kind))
        })?;
        let body = serde_json::to_value(resource)
            .map_err(|e| Error::serialization(format!("{}/{}: {}", api_resource.kind, name, e)))?;
        Ok(Self {
            namespace: resource.namespace(),
            api_resource,
            name,
            body,
        })
    }

    /// Build a manifest from a namespaced CRD-backed type.
    pub fn from_crd<T>(name: &str, namespace: &str, resource: &T) -> Result<Self, Error>
    where
        T: HasApiResource + Serialize,
    {
        let body = serde_json::to_value(resource)
            .map_err(|e| Error::serialization(format!("{}/{}: {}", T::KIND, name, e)))?;
        Ok(Self {
            api_resource: T::api_resource(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            body,
        })
    }

    /// Resource kind
    pub fn kind(&self) -> &str {
        &self.api_resource.kind
    }

    /// `Kind/namespace/name` key, stable across runs
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.api_resource.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }
}

/// Strip server-populated metadata so an object read from the cluster can be
/// server-side applied again.
pub fn strip_export_metadata(meta: &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) {
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.generation = None;
}

// =============================================================================
// Conditions
// =============================================================================

/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// The "Ready" condition type for pods
pub const CONDITION_READY: &str = "Ready";

/// Check if a Kubernetes condition of the given type has status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::core::v1::PodCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Whether a pod is Running, has its Ready condition set and is not being
/// deleted.
pub fn is_pod_ready(pod: &k8s_openapi::api::core::v1::Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    pod.metadata.deletion_timestamp.is_none()
        && status.phase.as_deref() == Some("Running")
        && has_condition(status.conditions.as_deref(), CONDITION_READY)
}

/// Whether a Deployment's latest template is fully rolled out.
///
/// Same checks as `kubectl rollout status`: the controller has observed the
/// current generation, every desired replica is updated and available, and
/// no replica of an older template is left.
pub fn is_rollout_complete(deployment: &k8s_openapi::api::apps::v1::Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);

    status.observed_generation.unwrap_or(0) >= deployment.metadata.generation.unwrap_or(0)
        && updated >= desired
        && status.replicas.unwrap_or(0) <= updated
        && status.available_replicas.unwrap_or(0) >= updated
}

// =============================================================================
// Polling
// =============================================================================

/// Poll `check_fn` every `interval` until it yields a value or `timeout` elapses.
///
/// `check_fn` returns `Ok(Ok(value))` when done, `Ok(Err(reason))` to keep
/// waiting, and `Err` to abort. The last reason is carried in the timeout
/// error so the operator sees what never became ready.
pub async fn wait_with_timeout<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    description: &str,
    mut check_fn: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Result<T, String>, Error>>,
{
    let start = Instant::now();
    let mut last_reason = String::from("not checked");

    loop {
        if start.elapsed() >= timeout {
            return Err(Error::timeout(
                description,
                start.elapsed().as_secs(),
                last_reason,
            ));
        }

        match check_fn().await? {
            Ok(value) => return Ok(value),
            Err(reason) => {
                trace!(description, reason = %reason, "condition not met yet");
                last_reason = reason;
            }
        }

        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// Clients
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!("failed to read kubeconfig {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(Error::from)
}

/// Compute a deterministic hash of the input, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so the value is stable across toolchains and can be
/// persisted in annotations.
pub fn deterministic_hash(input: &[u8]) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input);
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
