//! CA extraction and trust propagation
//!
//! mitmproxy generates its CA on first start, so extraction races the proxy
//! pod's startup. Every new pod generates a new CA, so a pod of an older
//! template must never be read. [`TrustPropagator::extract_trust_bundle`]
//! polls until the proxy Deployment is fully rolled out and a ready pod
//! serves a parseable CA certificate, or the configured timeout elapses.
//!
//! The CA then goes three places: a local file for the operator, a Secret in
//! the proxy namespace, and the trust store of a consumer workload. Trust
//! stores are not declarative, so the consumer installs the certificate
//! itself from a `postStart` hook.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, ExecAction, Lifecycle, LifecycleHandler, PodSpec, PodTemplateSpec, Secret,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, X509Certificate};

use mitmesh_common::kube_utils::{
    deterministic_hash, is_rollout_complete, managed_labels, wait_with_timeout, Manifest,
};
use mitmesh_common::{Error, APP_LABEL};

use crate::client::ClusterApi;
use crate::config::ProvisionConfig;
use crate::proxy::ProxyDeployment;

/// Pod-template annotation carrying the hash of the trusted CA
pub const CA_HASH_ANNOTATION: &str = "mitmesh.io/ca-hash";

/// Where the consumer mounts the trust secret
pub const TRUST_MOUNT_PATH: &str = "/etc/mitmproxy";

/// System trust store location the consumer installs the CA into
const SYSTEM_CA_PATH: &str = "/usr/local/share/ca-certificates/mitmproxy-ca.crt";

const TRUST_VOLUME: &str = "mitmproxy-ca";

/// Proxy environment variables set on consumers. Both spellings are read by
/// common HTTP clients.
const PROXY_ENV_VARS: [&str; 4] = ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"];

/// The proxy's CA certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustBundle {
    pem: String,
}

impl TrustBundle {
    /// Parse and validate a PEM-encoded CA certificate.
    pub fn from_pem(bytes: &[u8]) -> Result<Self, Error> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(bytes)
            .map_err(|e| Error::serialization(format!("CA is not PEM: {}", e)))?;
        let (_, cert) = X509Certificate::from_der(&pem.contents)
            .map_err(|e| Error::serialization(format!("CA is not X.509: {}", e)))?;
        if !cert.is_ca() {
            return Err(Error::serialization(format!(
                "certificate {} is not a CA",
                cert.subject()
            )));
        }
        let pem = String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::serialization(format!("CA is not UTF-8: {}", e)))?;
        Ok(Self { pem })
    }

    /// Stand-in for rendering manifests before any proxy has run
    pub(crate) fn placeholder() -> Self {
        Self {
            pem: "# CA certificate extracted from the running proxy\n".to_string(),
        }
    }

    /// PEM text
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Stable short hash used to roll consumers when the CA changes
    pub fn hash(&self) -> String {
        deterministic_hash(self.pem.as_bytes())
    }
}

/// Opaque Secret holding the CA under a single key
pub fn build_trust_secret(bundle: &TrustBundle, namespace: &str, config: &ProvisionConfig) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(config.secret_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels(&config.secret_name)),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            config.secret_key.clone(),
            ByteString(bundle.pem().as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// Consumer Deployment routing through the proxy and trusting its CA
pub fn build_consumer_deployment(
    proxy: &ProxyDeployment,
    bundle: &TrustBundle,
    config: &ProvisionConfig,
) -> Deployment {
    let name = &config.consumer_name;
    let selector = BTreeMap::from([(APP_LABEL.to_string(), name.clone())]);
    let mut labels = managed_labels(name);
    labels.extend(selector.clone());

    let proxy_url = proxy.proxy_url();
    let env = PROXY_ENV_VARS
        .iter()
        .map(|var| EnvVar {
            name: var.to_string(),
            value: Some(proxy_url.clone()),
            ..Default::default()
        })
        .collect();

    let install_ca = format!(
        "cp {}/{} {} && update-ca-certificates",
        TRUST_MOUNT_PATH, config.secret_key, SYSTEM_CA_PATH
    );

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(proxy.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        CA_HASH_ANNOTATION.to_string(),
                        bundle.hash(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.clone(),
                        image: Some(config.consumer_image.clone()),
                        env: Some(env),
                        volume_mounts: Some(vec![VolumeMount {
                            name: TRUST_VOLUME.to_string(),
                            mount_path: TRUST_MOUNT_PATH.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        lifecycle: Some(Lifecycle {
                            post_start: Some(LifecycleHandler {
                                exec: Some(ExecAction {
                                    command: Some(vec![
                                        "sh".to_string(),
                                        "-c".to_string(),
                                        install_ca,
                                    ]),
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: TRUST_VOLUME.to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(config.secret_name.clone()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Moves the proxy CA to where it needs to be trusted
pub struct TrustPropagator<'a> {
    cluster: &'a dyn ClusterApi,
    config: &'a ProvisionConfig,
}

impl<'a> TrustPropagator<'a> {
    /// Create a propagator over the given cluster
    pub fn new(cluster: &'a dyn ClusterApi, config: &'a ProvisionConfig) -> Self {
        Self { cluster, config }
    }

    /// Copy the CA out of a running proxy pod.
    ///
    /// Polls every `trust_poll_interval` until `trust_timeout`. A rollout in
    /// progress, missing pods, missing or partial CA files and transient API
    /// errors keep polling; the deadline yields
    /// [`Error::TrustExtractionFailed`].
    pub async fn extract_trust_bundle(&self, proxy: &ProxyDeployment) -> Result<TrustBundle, Error> {
        let selector = proxy.selector();
        let cluster = self.cluster;

        let result = wait_with_timeout(
            self.config.trust_timeout,
            self.config.trust_poll_interval,
            "proxy CA",
            || {
                let selector = selector.as_str();
                async move {
                    match cluster.find_deployment(&proxy.namespace, selector).await {
                        Ok(Some(deployment)) if is_rollout_complete(&deployment) => {}
                        Ok(Some(_)) => {
                            let reason = format!("rollout of {} in progress", proxy.deployment);
                            return Ok(Err(reason));
                        }
                        Ok(None) => return Ok(Err(format!("no deployment matching {}", selector))),
                        Err(e) if e.is_retryable() => return Ok(Err(e.to_string())),
                        Err(e) => return Err(e),
                    }

                    let pod = match cluster.find_ready_pod(&proxy.namespace, selector).await {
                        Ok(Some(pod)) => pod,
                        Ok(None) => return Ok(Err(format!("no ready pod matching {}", selector))),
                        Err(e) if e.is_retryable() => return Ok(Err(e.to_string())),
                        Err(e) => return Err(e),
                    };

                    // Exec fails while the container restarts; keep polling
                    let contents = match cluster
                        .read_pod_file(&proxy.namespace, &pod, &proxy.container, &proxy.ca_path)
                        .await
                    {
                        Ok(Some(contents)) => contents,
                        Ok(None) => return Ok(Err(format!("{} not present in {}", proxy.ca_path, pod))),
                        Err(e) => return Ok(Err(format!("reading CA from {}: {}", pod, e))),
                    };

                    Ok(TrustBundle::from_pem(&contents).map_err(|e| e.to_string()))
                }
            },
        )
        .await;

        match result {
            Ok(bundle) => {
                info!(namespace = %proxy.namespace, hash = %bundle.hash(), "extracted proxy CA");
                Ok(bundle)
            }
            Err(Error::Timeout { message, .. }) => {
                Err(Error::trust_extraction(&proxy.namespace, selector, message))
            }
            Err(e) => Err(e),
        }
    }

    /// Write the CA to a local file
    pub async fn write_local(&self, bundle: &TrustBundle, path: &Path) -> Result<(), Error> {
        tokio::fs::write(path, bundle.pem()).await?;
        info!(path = %path.display(), "wrote proxy CA");
        Ok(())
    }

    /// Store the CA as a Secret in `namespace`
    pub async fn materialize_secret(&self, bundle: &TrustBundle, namespace: &str) -> Result<(), Error> {
        let secret = build_trust_secret(bundle, namespace, self.config);
        let outcome = self.cluster.apply(&Manifest::from_k8s(&secret)?).await?;
        info!(namespace = %namespace, secret = %self.config.secret_name, %outcome, "materialized trust secret");
        Ok(())
    }

    /// Deploy the workload that routes through the proxy and trusts its CA
    pub async fn deploy_trusting_workload(
        &self,
        proxy: &ProxyDeployment,
        bundle: &TrustBundle,
    ) -> Result<(), Error> {
        let deployment = build_consumer_deployment(proxy, bundle, self.config);
        let manifest = Manifest::from_k8s(&deployment)?;
        let outcome = self.cluster.apply(&manifest).await?;
        debug!(proxy_url = %proxy.proxy_url(), "consumer routed through proxy");
        info!(resource = %manifest.key(), %outcome, "deployed trusting workload");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::MockClusterApi;
    use crate::Outcome;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) fn test_ca_pem() -> String {
        let mut params = rcgen::CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "mitmproxy");
        let key = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    fn fast_config() -> ProvisionConfig {
        ProvisionConfig {
            trust_timeout: Duration::from_millis(50),
            trust_poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn proxy() -> ProxyDeployment {
        ProxyDeployment::from_config(&ProvisionConfig::default(), "mitmproxy")
    }

    fn proxy_deployment(generation: i64, observed: i64, replicas: i32) -> Deployment {
        let mut deployment =
            crate::proxy::build_proxy_deployment(&proxy(), &ProvisionConfig::default());
        deployment.metadata.generation = Some(generation);
        deployment.status = Some(k8s_openapi::api::apps::v1::DeploymentStatus {
            observed_generation: Some(observed),
            replicas: Some(replicas),
            updated_replicas: Some(1),
            available_replicas: Some(1),
            ..Default::default()
        });
        deployment
    }

    fn rolled_out(cluster: &mut MockClusterApi) {
        cluster
            .expect_find_deployment()
            .withf(|ns, selector| ns == "mitmproxy" && selector == "app=mitmproxy")
            .returning(|_, _| Ok(Some(proxy_deployment(1, 1, 1))));
    }

    #[test]
    fn bundle_requires_a_ca_certificate() {
        assert!(TrustBundle::from_pem(test_ca_pem().as_bytes()).is_ok());
        assert!(TrustBundle::from_pem(b"").is_err());
        assert!(TrustBundle::from_pem(b"-----BEGIN CERTIFICATE-----\nAAAA").is_err());

        let leaf = rcgen::generate_simple_self_signed(vec!["leaf.local".to_string()])
            .unwrap()
            .cert
            .pem();
        assert!(TrustBundle::from_pem(leaf.as_bytes()).is_err());
    }

    #[test]
    fn secret_has_exactly_one_key() {
        let bundle = TrustBundle::from_pem(test_ca_pem().as_bytes()).unwrap();
        let secret = build_trust_secret(&bundle, "mitmproxy", &ProvisionConfig::default());
        let data = secret.data.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data["mitmproxy-ca.pem"].0, bundle.pem().as_bytes());
    }

    #[test]
    fn consumer_routes_through_proxy_and_installs_ca() {
        let bundle = TrustBundle::from_pem(test_ca_pem().as_bytes()).unwrap();
        let deployment =
            build_consumer_deployment(&proxy(), &bundle, &ProvisionConfig::default());
        let template = deployment.spec.unwrap().template;
        assert_eq!(
            template.metadata.unwrap().annotations.unwrap()[CA_HASH_ANNOTATION],
            bundle.hash()
        );

        let pod = template.spec.unwrap();
        let container = &pod.containers[0];
        let env = container.env.clone().unwrap();
        for var in PROXY_ENV_VARS {
            let value = env.iter().find(|e| e.name == var).and_then(|e| e.value.clone());
            assert_eq!(value.as_deref(), Some("http://mitmproxy-svc.mitmproxy:8080/"));
        }

        let mount = &container.volume_mounts.clone().unwrap()[0];
        assert_eq!(mount.mount_path, TRUST_MOUNT_PATH);
        assert_eq!(mount.read_only, Some(true));

        let hook = container
            .lifecycle
            .as_ref()
            .and_then(|l| l.post_start.as_ref())
            .and_then(|h| h.exec.as_ref())
            .and_then(|e| e.command.clone())
            .unwrap();
        assert!(hook[2].contains("update-ca-certificates"));
        assert!(hook[2].contains("/etc/mitmproxy/mitmproxy-ca.pem"));

        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(
            volume.secret.as_ref().and_then(|s| s.secret_name.as_deref()),
            Some("mitmproxysecret")
        );
    }

    #[tokio::test]
    async fn extraction_waits_for_pod_to_become_ready() {
        let pem = test_ca_pem();
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();

        let mut cluster = MockClusterApi::new();
        rolled_out(&mut cluster);
        cluster
            .expect_find_ready_pod()
            .returning(move |_, _| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(None)
                } else {
                    Ok(Some("mitmproxy-abc".to_string()))
                }
            });
        let served = pem.clone();
        cluster
            .expect_read_pod_file()
            .withf(|ns, pod, container, path| {
                ns == "mitmproxy"
                    && pod == "mitmproxy-abc"
                    && container == "mitmproxy"
                    && path.ends_with("mitmproxy-ca-cert.pem")
            })
            .returning(move |_, _, _, _| Ok(Some(served.clone().into_bytes())));

        let config = ProvisionConfig {
            trust_timeout: Duration::from_secs(5),
            ..fast_config()
        };
        let bundle = TrustPropagator::new(&cluster, &config)
            .extract_trust_bundle(&proxy())
            .await
            .unwrap();
        assert_eq!(bundle.pem(), pem);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn extraction_fails_only_after_timeout() {
        let mut cluster = MockClusterApi::new();
        rolled_out(&mut cluster);
        cluster.expect_find_ready_pod().returning(|_, _| Ok(None));
        cluster.expect_read_pod_file().never();
        let config = fast_config();

        let started = std::time::Instant::now();
        let err = TrustPropagator::new(&cluster, &config)
            .extract_trust_bundle(&proxy())
            .await
            .unwrap_err();
        assert!(started.elapsed() >= config.trust_timeout);
        match err {
            Error::TrustExtractionFailed {
                namespace,
                selector,
                message,
            } => {
                assert_eq!(namespace, "mitmproxy");
                assert_eq!(selector, "app=mitmproxy");
                assert!(message.contains("no ready pod"));
            }
            other => panic!("expected trust extraction failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn missing_ca_file_keeps_polling() {
        let mut cluster = MockClusterApi::new();
        rolled_out(&mut cluster);
        cluster
            .expect_find_ready_pod()
            .returning(|_, _| Ok(Some("mitmproxy-abc".to_string())));
        cluster
            .expect_read_pod_file()
            .returning(|_, _, _, _| Ok(None));
        let config = fast_config();

        let err = TrustPropagator::new(&cluster, &config)
            .extract_trust_bundle(&proxy())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TrustExtractionFailed { .. }));
    }

    #[tokio::test]
    async fn permanent_api_errors_abort_extraction() {
        let mut cluster = MockClusterApi::new();
        rolled_out(&mut cluster);
        cluster.expect_find_ready_pod().times(1).returning(|_, _| {
            Err(Error::from(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "pods is forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            })))
        });
        let config = fast_config();

        let err = TrustPropagator::new(&cluster, &config)
            .extract_trust_bundle(&proxy())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kube { .. }));
    }

    #[tokio::test]
    async fn extraction_waits_for_rollout_before_reading_any_pod() {
        let pem = test_ca_pem();
        let lookups = Arc::new(AtomicU32::new(0));
        let counter = lookups.clone();

        let mut cluster = MockClusterApi::new();
        cluster.expect_find_deployment().returning(move |_, _| {
            Ok(Some(match counter.fetch_add(1, Ordering::SeqCst) {
                // Template changed, controller has not observed it yet
                0 => proxy_deployment(2, 1, 1),
                // New pod up, pod of the old template still counted
                1 => proxy_deployment(2, 2, 2),
                _ => proxy_deployment(2, 2, 1),
            }))
        });
        cluster
            .expect_find_ready_pod()
            .times(1)
            .returning(|_, _| Ok(Some("mitmproxy-new".to_string())));
        let served = pem.clone();
        cluster
            .expect_read_pod_file()
            .withf(|_, pod, _, _| pod == "mitmproxy-new")
            .times(1)
            .returning(move |_, _, _, _| Ok(Some(served.clone().into_bytes())));

        let config = ProvisionConfig {
            trust_timeout: Duration::from_secs(5),
            ..fast_config()
        };
        let bundle = TrustPropagator::new(&cluster, &config)
            .extract_trust_bundle(&proxy())
            .await
            .unwrap();
        assert_eq!(bundle.pem(), pem);
        assert_eq!(lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stalled_rollout_times_out() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_find_deployment()
            .returning(|_, _| Ok(Some(proxy_deployment(2, 2, 2))));
        cluster.expect_find_ready_pod().never();
        let config = fast_config();

        let err = TrustPropagator::new(&cluster, &config)
            .extract_trust_bundle(&proxy())
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::TrustExtractionFailed { ref message, .. } if message.contains("rollout"))
        );
    }

    #[tokio::test]
    async fn write_local_writes_pem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mitmproxy-ca.pem");
        let bundle = TrustBundle::from_pem(test_ca_pem().as_bytes()).unwrap();
        let cluster = MockClusterApi::new();
        let config = ProvisionConfig::default();

        TrustPropagator::new(&cluster, &config)
            .write_local(&bundle, &path)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), bundle.pem());
    }

    #[tokio::test]
    async fn secret_and_consumer_are_applied() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_apply()
            .withf(|m| m.kind() == "Secret" && m.name == "mitmproxysecret")
            .times(1)
            .returning(|_| Ok(Outcome::Created));
        cluster
            .expect_apply()
            .withf(|m| m.kind() == "Deployment" && m.name == "mitmproxy-client")
            .times(1)
            .returning(|_| Ok(Outcome::Created));
        let config = ProvisionConfig::default();
        let bundle = TrustBundle::from_pem(test_ca_pem().as_bytes()).unwrap();
        let propagator = TrustPropagator::new(&cluster, &config);

        propagator
            .materialize_secret(&bundle, "mitmproxy")
            .await
            .unwrap();
        propagator
            .deploy_trusting_workload(&proxy(), &bundle)
            .await
            .unwrap();
    }
}
