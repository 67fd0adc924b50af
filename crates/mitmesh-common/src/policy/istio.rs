//! Istio networking and security types
//!
//! Only the fields mitmesh sets are modelled. Every type serializes to a
//! complete object suitable for server-side apply.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kube_utils::{HasApiResource, ObjectMeta};

/// Macro to implement default_api_version() and default_kind() for types
/// implementing HasApiResource.
macro_rules! impl_api_defaults {
    ($type:ty) => {
        impl $type {
            fn default_api_version() -> String {
                <Self as HasApiResource>::API_VERSION.to_string()
            }
            fn default_kind() -> String {
                <Self as HasApiResource>::KIND.to_string()
            }
        }
    };
}

// =============================================================================
// Gateway (networking.istio.io)
// =============================================================================

/// Istio Gateway bound to the mesh ingress gateway pods
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    /// API version
    #[serde(default = "Gateway::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "Gateway::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: GatewaySpec,
}

impl HasApiResource for Gateway {
    const API_VERSION: &'static str = "networking.istio.io/v1beta1";
    const KIND: &'static str = "Gateway";
}

impl_api_defaults!(Gateway);

impl Gateway {
    /// Create a new Gateway
    pub fn new(metadata: ObjectMeta, spec: GatewaySpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// Gateway spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GatewaySpec {
    /// Labels selecting the gateway proxy pods (e.g. `istio: ingressgateway`)
    pub selector: BTreeMap<String, String>,
    /// Exposed servers
    pub servers: Vec<GatewayServer>,
}

/// A port/protocol/hosts triple exposed by a Gateway
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GatewayServer {
    /// Port definition
    pub port: GatewayPort,
    /// Hosts served (`*` for any)
    pub hosts: Vec<String>,
}

/// Gateway port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GatewayPort {
    /// Port number
    pub number: u16,
    /// Port name
    pub name: String,
    /// Protocol (HTTP, HTTPS, TCP, ...)
    pub protocol: String,
}

// =============================================================================
// VirtualService (networking.istio.io)
// =============================================================================

/// Istio VirtualService routing gateway traffic to a destination service
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualService {
    /// API version
    #[serde(default = "VirtualService::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "VirtualService::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: VirtualServiceSpec,
}

impl HasApiResource for VirtualService {
    const API_VERSION: &'static str = "networking.istio.io/v1beta1";
    const KIND: &'static str = "VirtualService";
}

impl_api_defaults!(VirtualService);

impl VirtualService {
    /// Create a new VirtualService
    pub fn new(metadata: ObjectMeta, spec: VirtualServiceSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// VirtualService spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VirtualServiceSpec {
    /// Hosts this routing applies to
    pub hosts: Vec<String>,
    /// Gateways the routes are bound to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<String>,
    /// HTTP routes, evaluated in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpRoute>,
}

/// HTTP route
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    /// Match conditions (empty matches everything)
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<HttpMatchRequest>,
    /// Weighted destinations
    pub route: Vec<HttpRouteDestination>,
}

/// HTTP match condition
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpMatchRequest {
    /// URI match
    pub uri: StringMatch,
}

/// String match (only prefix is used)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StringMatch {
    /// Prefix match
    pub prefix: String,
}

/// Route destination wrapper
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpRouteDestination {
    /// Destination
    pub destination: Destination,
}

/// Destination service and port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Destination {
    /// Fully qualified service host
    pub host: String,
    /// Target port
    pub port: PortSelector,
}

/// Port selector
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PortSelector {
    /// Port number
    pub number: u16,
}

// =============================================================================
// AuthorizationPolicy (security.istio.io)
// =============================================================================

/// Istio AuthorizationPolicy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicy {
    /// API version
    #[serde(default = "AuthorizationPolicy::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "AuthorizationPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: AuthorizationPolicySpec,
}

impl HasApiResource for AuthorizationPolicy {
    const API_VERSION: &'static str = "security.istio.io/v1";
    const KIND: &'static str = "AuthorizationPolicy";
}

impl_api_defaults!(AuthorizationPolicy);

impl AuthorizationPolicy {
    /// Create a new AuthorizationPolicy
    pub fn new(metadata: ObjectMeta, spec: AuthorizationPolicySpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }

    /// ALLOW policy with a single empty rule: every request to the selected
    /// workloads is allowed.
    pub fn allow_all(metadata: ObjectMeta, match_labels: BTreeMap<String, String>) -> Self {
        Self::new(
            metadata,
            AuthorizationPolicySpec {
                selector: Some(WorkloadSelector { match_labels }),
                action: "ALLOW".to_string(),
                rules: vec![AuthorizationRule::default()],
            },
        )
    }
}

/// AuthorizationPolicy spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicySpec {
    /// Selector for workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<WorkloadSelector>,

    /// Action: ALLOW, DENY, AUDIT, CUSTOM (empty = implicit deny-all)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,

    /// Rules. Note: an ALLOW policy with no rules denies everything, so
    /// allow-all needs one empty rule.
    #[serde(default)]
    pub rules: Vec<AuthorizationRule>,
}

/// Workload selector for AuthorizationPolicy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelector {
    /// Match labels
    pub match_labels: BTreeMap<String, String>,
}

/// Authorization rule. Empty means "match everything".
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthorizationRule {}
