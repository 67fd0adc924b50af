//! mitmproxy Deployment and Service

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Probe, Service, ServicePort, ServiceSpec,
    TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use tracing::info;

use mitmesh_common::kube_utils::{label_selector, managed_labels, Manifest};
use mitmesh_common::{Error, APP_LABEL};

use crate::client::ClusterApi;
use crate::config::ProvisionConfig;

/// Name of the proxy container
pub const PROXY_CONTAINER: &str = "mitmproxy";

/// The deployed proxy and its stable in-cluster address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyDeployment {
    /// Namespace the proxy runs in
    pub namespace: String,
    /// Deployment name
    pub deployment: String,
    /// Service name
    pub service: String,
    /// Proxy listen port
    pub port: u16,
    /// Value of the `app` label selecting the proxy pods
    pub app_label: String,
    /// Container holding the CA
    pub container: String,
    /// CA path inside the container
    pub ca_path: String,
}

impl ProxyDeployment {
    /// Describe the proxy `config` would deploy into `namespace`
    pub fn from_config(config: &ProvisionConfig, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            deployment: config.proxy_app.clone(),
            service: config.proxy_service.clone(),
            port: config.proxy_port,
            app_label: config.proxy_app.clone(),
            container: PROXY_CONTAINER.to_string(),
            ca_path: config.proxy_ca_path.clone(),
        }
    }

    /// `<service>.<namespace>:<port>`
    pub fn endpoint(&self) -> String {
        format!("{}.{}:{}", self.service, self.namespace, self.port)
    }

    /// Value for `http_proxy`-style environment variables
    pub fn proxy_url(&self) -> String {
        format!("http://{}/", self.endpoint())
    }

    /// Fully qualified service host inside the cluster
    pub fn service_fqdn(&self) -> String {
        format!("{}.{}.svc.cluster.local", self.service, self.namespace)
    }

    /// Pod labels selecting the proxy
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(APP_LABEL.to_string(), self.app_label.clone())])
    }

    /// `app=<proxy>` label selector string
    pub fn selector(&self) -> String {
        label_selector(&self.selector_labels())
    }
}

fn proxy_labels(proxy: &ProxyDeployment) -> BTreeMap<String, String> {
    let mut labels = managed_labels(&proxy.deployment);
    labels.extend(proxy.selector_labels());
    labels
}

/// The mitmproxy Deployment.
///
/// Runs `mitmweb` so the flows are inspectable on the web port;
/// `block_global=false` lets clients outside the pod network connect.
pub fn build_proxy_deployment(proxy: &ProxyDeployment, config: &ProvisionConfig) -> Deployment {
    let labels = proxy_labels(proxy);
    let proxy_port = proxy.port as i32;
    let web_port = config.web_port as i32;

    Deployment {
        metadata: ObjectMeta {
            name: Some(proxy.deployment.clone()),
            namespace: Some(proxy.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(proxy.selector_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: proxy.container.clone(),
                        image: Some(config.proxy_image.clone()),
                        command: Some(vec![
                            "mitmweb".to_string(),
                            "--web-host".to_string(),
                            "0.0.0.0".to_string(),
                            "--web-port".to_string(),
                            web_port.to_string(),
                            "--listen-port".to_string(),
                            proxy_port.to_string(),
                            "--set".to_string(),
                            "block_global=false".to_string(),
                        ]),
                        ports: Some(vec![
                            ContainerPort {
                                name: Some("proxy".to_string()),
                                container_port: proxy_port,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                            ContainerPort {
                                name: Some("web".to_string()),
                                container_port: web_port,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                        ]),
                        readiness_probe: Some(Probe {
                            tcp_socket: Some(TCPSocketAction {
                                port: IntOrString::Int(proxy_port),
                                ..Default::default()
                            }),
                            initial_delay_seconds: Some(2),
                            period_seconds: Some(5),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP Service exposing the proxy and web ports
pub fn build_proxy_service(proxy: &ProxyDeployment, config: &ProvisionConfig) -> Service {
    let port = |name: &str, number: u16| ServicePort {
        name: Some(name.to_string()),
        port: number as i32,
        target_port: Some(IntOrString::Int(number as i32)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };

    Service {
        metadata: ObjectMeta {
            name: Some(proxy.service.clone()),
            namespace: Some(proxy.namespace.clone()),
            labels: Some(managed_labels(&proxy.service)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(proxy.selector_labels()),
            ports: Some(vec![port("proxy", proxy.port), port("web", config.web_port)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Applies the proxy workload and its service
pub struct ProxyDeployer<'a> {
    cluster: &'a dyn ClusterApi,
    config: &'a ProvisionConfig,
}

impl<'a> ProxyDeployer<'a> {
    /// Create a deployer over the given cluster
    pub fn new(cluster: &'a dyn ClusterApi, config: &'a ProvisionConfig) -> Self {
        Self { cluster, config }
    }

    /// Manifests [`deploy_proxy`](Self::deploy_proxy) applies, in order
    pub fn manifests_for(
        proxy: &ProxyDeployment,
        config: &ProvisionConfig,
    ) -> Result<Vec<Manifest>, Error> {
        Ok(vec![
            Manifest::from_k8s(&build_proxy_deployment(proxy, config))?,
            Manifest::from_k8s(&build_proxy_service(proxy, config))?,
        ])
    }

    /// Apply the proxy Deployment and Service. Re-running overwrites both.
    ///
    /// Applied under [`FIELD_MANAGER`](mitmesh_common::FIELD_MANAGER), so a
    /// sidecar applied under the injection field manager is left in place.
    pub async fn deploy_proxy(&self, namespace: &str) -> Result<ProxyDeployment, Error> {
        let proxy = ProxyDeployment::from_config(self.config, namespace);
        for manifest in Self::manifests_for(&proxy, self.config)? {
            let outcome = self.cluster.apply(&manifest).await?;
            info!(resource = %manifest.key(), %outcome, "applied proxy resource");
        }
        info!(endpoint = %proxy.endpoint(), "proxy deployed");
        Ok(proxy)
    }
}
