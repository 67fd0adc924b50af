//! Istio resource types written by the mesh reconciler
//!
//! - `Gateway` / `VirtualService`: route mesh ingress traffic to the proxy
//! - `AuthorizationPolicy`: explicitly allow all traffic to the proxy
//!
//! All types implement `HasApiResource` for consistent API version and kind
//! handling.

mod istio;

pub use istio::{
    AuthorizationPolicy, AuthorizationPolicySpec, AuthorizationRule, Destination, Gateway,
    GatewayPort, GatewayServer, GatewaySpec, HttpMatchRequest, HttpRoute, HttpRouteDestination,
    PortSelector, StringMatch, VirtualService, VirtualServiceSpec, WorkloadSelector,
};
