//! Mesh-aware provisioning of a mitmproxy interception proxy
//!
//! A run resolves the cluster context, creates a privileged identity,
//! bootstraps the proxy namespace, deploys the proxy, propagates its CA to a
//! consuming workload and finally neutralizes whichever service mesh would
//! otherwise inject a sidecar in front of the proxy.
//!
//! Every cluster and cloud call goes through a trait seam ([`ClusterApi`],
//! [`CloudSession`], [`SidecarInjector`]) so components can be exercised
//! against mocks and in-memory fakes.

#![deny(missing_docs)]

pub mod client;
mod command;
pub mod config;
pub mod context;
pub mod identity;
pub mod injector;
pub mod mesh;
pub mod namespace;
pub mod orchestrator;
pub mod proxy;
pub mod session;
pub mod trust;

pub use client::{ClusterApi, KubeClusterApi};
pub use config::ProvisionConfig;
pub use context::ClusterContext;
pub use identity::{RoleScope, ServiceIdentity};
pub use injector::{LinkerdCli, SidecarInjector};
pub use mesh::{MeshPolicySet, ServiceMeshKind};
pub use orchestrator::{Orchestrator, RunReport};
pub use proxy::ProxyDeployment;
pub use session::{CloudSession, GcloudSession};
pub use trust::TrustBundle;

/// Whether an ensure call created the object or found it already present
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The object did not exist and was created
    Created,
    /// The object existed and was left in (or converged to) the desired state
    Existing,
}

impl Outcome {
    /// Lowercase name for logs and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Existing => "existing",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value produced by an idempotent ensure call, plus what the call did
#[derive(Clone, Debug, PartialEq)]
pub struct Ensured<T> {
    /// The ensured object
    pub value: T,
    /// Whether it was created on this run
    pub outcome: Outcome,
}

impl<T> Ensured<T> {
    /// Pair a value with its outcome
    pub fn new(value: T, outcome: Outcome) -> Self {
        Self { value, outcome }
    }

    /// Whether the call created the object
    pub fn created(&self) -> bool {
        self.outcome == Outcome::Created
    }
}
