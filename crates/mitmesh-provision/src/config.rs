//! Provisioning configuration
//!
//! Built once at startup and passed by reference to every component. No
//! component reads environment variables or other ambient process state.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mitmesh_common::{Error, Result};

/// Immutable configuration for a provisioning run.
///
/// Every field has a default so a run needs no flags. A YAML file may
/// override any subset (`#[serde(default)]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProvisionConfig {
    /// Namespace the proxy and consumer live in
    pub namespace: String,
    /// Google service account id (the part before `@`)
    pub identity_name: String,
    /// IAM role granted at project scope
    pub project_role: String,
    /// ClusterRole bound cluster-wide to the identity
    pub cluster_role: String,
    /// ClusterRole bound to the identity inside the namespace
    pub namespace_role: String,
    /// Value of the `app` label on the proxy pods and deployment name
    pub proxy_app: String,
    /// Proxy container image
    pub proxy_image: String,
    /// Proxy Service name
    pub proxy_service: String,
    /// Port the proxy listens on
    pub proxy_port: u16,
    /// Port of the mitmweb UI
    pub web_port: u16,
    /// Path of the CA certificate inside the proxy container
    pub proxy_ca_path: String,
    /// Secret holding the CA
    pub secret_name: String,
    /// Key of the CA inside the secret
    pub secret_key: String,
    /// Name of the workload that routes through the proxy
    pub consumer_name: String,
    /// Consumer image (must ship `update-ca-certificates`)
    pub consumer_image: String,
    /// Local file the extracted CA is written to
    pub ca_output: PathBuf,
    /// How long to wait for the proxy CA to appear
    #[serde(with = "duration_secs")]
    pub trust_timeout: Duration,
    /// Interval between CA extraction attempts
    #[serde(with = "duration_secs")]
    pub trust_poll_interval: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            namespace: "mitmproxy".to_string(),
            identity_name: "mitmproxy-admin".to_string(),
            project_role: "roles/container.admin".to_string(),
            cluster_role: "cluster-admin".to_string(),
            namespace_role: "admin".to_string(),
            proxy_app: "mitmproxy".to_string(),
            proxy_image: "mitmproxy/mitmproxy:latest".to_string(),
            proxy_service: "mitmproxy-svc".to_string(),
            proxy_port: 8080,
            web_port: 8081,
            proxy_ca_path: "/home/mitmproxy/.mitmproxy/mitmproxy-ca-cert.pem".to_string(),
            secret_name: "mitmproxysecret".to_string(),
            secret_key: "mitmproxy-ca.pem".to_string(),
            consumer_name: "mitmproxy-client".to_string(),
            consumer_image: "nginx:stable".to_string(),
            ca_output: PathBuf::from("mitmproxy-ca.pem"),
            trust_timeout: Duration::from_secs(300),
            trust_poll_interval: Duration::from_secs(5),
        }
    }
}

impl ProvisionConfig {
    /// Validate names, ports and timeouts.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("proxyApp", &self.proxy_app),
            ("proxyService", &self.proxy_service),
            ("secretName", &self.secret_name),
            ("consumerName", &self.consumer_name),
            ("identityName", &self.identity_name),
        ] {
            if !is_dns1123_label(value) {
                return Err(Error::config(format!(
                    "{} '{}' is not a valid DNS-1123 label",
                    field, value
                )));
            }
        }
        // Binding names are derived from the role's alphanumeric characters
        for (field, value) in [
            ("projectRole", &self.project_role),
            ("clusterRole", &self.cluster_role),
            ("namespaceRole", &self.namespace_role),
        ] {
            if !value.chars().any(|c| c.is_ascii_alphanumeric()) {
                return Err(Error::config(format!(
                    "{} '{}' does not name a role",
                    field, value
                )));
            }
        }
        // Google service account ids are 6-30 characters
        if !(6..=30).contains(&self.identity_name.len()) {
            return Err(Error::config(format!(
                "identityName '{}' must be 6-30 characters",
                self.identity_name
            )));
        }
        if self.proxy_port == 0 || self.web_port == 0 || self.proxy_port == self.web_port {
            return Err(Error::config(
                "proxyPort and webPort must be non-zero and distinct",
            ));
        }
        if self.secret_key.is_empty() || self.proxy_ca_path.is_empty() {
            return Err(Error::config("secretKey and proxyCaPath must be set"));
        }
        if self.trust_timeout.is_zero() || self.trust_poll_interval.is_zero() {
            return Err(Error::config(
                "trustTimeout and trustPollInterval must be non-zero",
            ));
        }
        Ok(())
    }
}

fn is_dns1123_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
