//! Common types for mitmesh: errors, retry, Kubernetes helpers and mesh resources

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod mesh;
pub mod policy;
pub mod retry;

pub use error::{Error, Step};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "mitmesh";

/// Field manager owning the sidecar-injected proxy template. Fields it owns
/// survive a re-apply under [`FIELD_MANAGER`] that omits them.
pub const INJECTION_FIELD_MANAGER: &str = "mitmesh-injector";

/// Label key naming the resource (`app.kubernetes.io/name`)
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Label key recording who manages the resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] for resources created by mitmesh
pub const LABEL_MANAGED_BY_MITMESH: &str = "mitmesh";

/// Pod label key used to select the proxy and consumer workloads
pub const APP_LABEL: &str = "app";
