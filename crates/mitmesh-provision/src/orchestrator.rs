//! Provisioning orchestrator
//!
//! Runs the components in a fixed order, each step's postcondition being the
//! next step's precondition:
//!
//! 1. resolve-context: no mutations, fails closed
//! 2. provision-identity: service account, project and cluster bindings
//! 3. bootstrap-namespace: namespace, admin binding, network policy
//! 4. neutralize-mesh: detect the mesh, disable namespace injection
//! 5. deploy-proxy: proxy Deployment and Service
//! 6. reconcile-mesh: Istio routing objects or Linkerd sidecar re-injection
//! 7. propagate-trust: CA extraction, local file, Secret, consumer
//!
//! Everything that changes the proxy pod template happens before the CA is
//! read, so the propagated CA is the one the running proxy serves.
//!
//! Failures are wrapped with the step they occurred in. Nothing is rolled
//! back; every step is idempotent so re-running is the recovery path.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use mitmesh_common::kube_utils::Manifest;
use mitmesh_common::{Error, Step};

use crate::client::ClusterApi;
use crate::config::ProvisionConfig;
use crate::context::{self, ClusterContext};
use crate::identity::{
    build_cluster_role_binding, build_role_binding, IdentityProvisioner, RoleScope,
    ServiceIdentity,
};
use crate::injector::SidecarInjector;
use crate::mesh::reconciler::{istio_policy_set, neutralization_patch};
use crate::mesh::{MeshDetector, MeshPolicyReconciler, MeshPolicySet, ServiceMeshKind};
use crate::namespace::{build_namespace, build_permissive_network_policy, NamespaceBootstrapper};
use crate::proxy::{ProxyDeployer, ProxyDeployment};
use crate::session::CloudSession;
use crate::trust::{build_consumer_deployment, build_trust_secret, TrustBundle, TrustPropagator};
use crate::{Ensured, Outcome};

/// What a successful run did
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    /// Resolved cluster
    pub context: ClusterContext,
    /// Service identity and whether it was created
    pub identity: Ensured<ServiceIdentity>,
    /// Namespace and whether it was created
    pub namespace: Ensured<String>,
    /// Deployed proxy
    pub proxy: ProxyDeployment,
    /// Hash of the propagated CA
    pub ca_hash: String,
    /// Local file the CA was written to
    pub ca_path: PathBuf,
    /// Mesh detected in the namespace
    pub mesh: ServiceMeshKind,
    /// Number of mesh policy objects applied
    pub mesh_objects: usize,
}

/// Sequences every provisioning step against the given seams
pub struct Orchestrator {
    cluster: Arc<dyn ClusterApi>,
    session: Arc<dyn CloudSession>,
    injector: Arc<dyn SidecarInjector>,
    config: ProvisionConfig,
}

impl Orchestrator {
    /// Create an orchestrator
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        session: Arc<dyn CloudSession>,
        injector: Arc<dyn SidecarInjector>,
        config: ProvisionConfig,
    ) -> Self {
        Self {
            cluster,
            session,
            injector,
            config,
        }
    }

    /// Configuration this orchestrator runs with
    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    async fn step<T, F>(&self, step: Step, operation: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        info!(step = %step, "starting step");
        let started = Instant::now();
        match operation.await {
            Ok(value) => {
                info!(
                    step = %step,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "step complete"
                );
                Ok(value)
            }
            Err(e) => {
                error!(step = %step, error = %e, "step failed");
                Err(e.in_step(step))
            }
        }
    }

    /// Run every step once.
    pub async fn run(&self) -> Result<RunReport, Error> {
        self.config.validate()?;
        let config = &self.config;
        let cluster = self.cluster.as_ref();
        let session = self.session.as_ref();

        let context = self.step(Step::Context, context::resolve(session)).await?;

        let identities = IdentityProvisioner::new(session, cluster, config);
        let identity = self
            .step(Step::Identity, async {
                let identity = identities.ensure_identity(&context).await?;
                identities
                    .bind_role(
                        &identity.value,
                        &config.project_role,
                        &RoleScope::Project(context.project_id.clone()),
                    )
                    .await?;
                identities
                    .bind_role(&identity.value, &config.cluster_role, &RoleScope::Cluster)
                    .await?;
                Ok::<_, Error>(identity)
            })
            .await?;

        let bootstrapper = NamespaceBootstrapper::new(cluster, config);
        let namespace = self
            .step(Step::Namespace, async {
                let namespace = bootstrapper.ensure_namespace(&config.namespace).await?;
                bootstrapper
                    .ensure_admin_binding(&namespace.value, &identity.value)
                    .await?;
                bootstrapper
                    .apply_permissive_network_policy(&namespace.value)
                    .await?;
                Ok::<_, Error>(namespace)
            })
            .await?;

        let reconciler = MeshPolicyReconciler::new(cluster, self.injector.as_ref());
        let mesh = self
            .step(Step::Neutralize, async {
                let kind = MeshDetector::new(cluster).detect(&namespace.value).await?;
                reconciler.neutralize_namespace(kind, &namespace.value).await?;
                Ok::<_, Error>(kind)
            })
            .await?;

        let proxy = self
            .step(
                Step::Proxy,
                ProxyDeployer::new(cluster, config).deploy_proxy(&namespace.value),
            )
            .await?;

        let policy = self
            .step(Step::Mesh, reconciler.reconcile(mesh, &proxy))
            .await?;

        let propagator = TrustPropagator::new(cluster, config);
        let bundle = self
            .step(Step::Trust, async {
                let bundle = propagator.extract_trust_bundle(&proxy).await?;
                propagator.write_local(&bundle, &config.ca_output).await?;
                propagator
                    .materialize_secret(&bundle, &proxy.namespace)
                    .await?;
                propagator.deploy_trusting_workload(&proxy, &bundle).await?;
                Ok::<_, Error>(bundle)
            })
            .await?;

        let report = RunReport {
            context,
            identity,
            namespace,
            ca_hash: bundle.hash(),
            ca_path: config.ca_output.clone(),
            mesh,
            mesh_objects: policy.manifests()?.len(),
            proxy,
        };
        info!(
            context = %report.context,
            endpoint = %report.proxy.endpoint(),
            mesh = %report.mesh,
            identity_created = report.identity.created(),
            namespace_created = report.namespace.outcome == Outcome::Created,
            "provisioning complete"
        );
        Ok(report)
    }
}

/// Every object a run would write, without touching the cluster or cloud.
///
/// Objects come in run order. The CA is a placeholder since it only exists
/// once the proxy runs. For Linkerd only the namespace markers are rendered:
/// the injected deployment depends on the live object.
pub fn render_manifests(
    config: &ProvisionConfig,
    context: &ClusterContext,
    mesh: ServiceMeshKind,
) -> Result<Vec<Manifest>, Error> {
    config.validate()?;
    let namespace = &config.namespace;
    let identity = ServiceIdentity {
        name: config.identity_name.clone(),
        project_id: context.project_id.clone(),
    };
    let proxy = ProxyDeployment::from_config(config, namespace);
    let bundle = TrustBundle::placeholder();

    let mut manifests = vec![
        Manifest::from_k8s(&build_cluster_role_binding(&identity, &config.cluster_role))?,
        Manifest::from_k8s(&build_namespace(namespace))?,
        Manifest::from_k8s(&build_role_binding(
            &identity,
            &config.namespace_role,
            namespace,
        ))?,
        Manifest::from_k8s(&build_permissive_network_policy(namespace)?)?,
    ];

    let policy = match mesh {
        ServiceMeshKind::Istio => istio_policy_set(&proxy),
        ServiceMeshKind::None => MeshPolicySet::Empty,
        ServiceMeshKind::Linkerd => {
            let patch = neutralization_patch(ServiceMeshKind::Linkerd);
            manifests.push(Manifest::from_k8s(&patch.to_namespace(namespace))?);
            MeshPolicySet::Empty
        }
        ServiceMeshKind::Unknown => {
            return Err(Error::unknown_mesh(namespace, "cannot render an unknown mesh"))
        }
    };
    if let Some(patch) = policy.namespace_patch() {
        manifests.push(Manifest::from_k8s(&patch.to_namespace(namespace))?);
    }
    manifests.extend(ProxyDeployer::manifests_for(&proxy, config)?);
    manifests.extend(policy.manifests()?);
    manifests.push(Manifest::from_k8s(&build_trust_secret(
        &bundle, namespace, config,
    ))?);
    manifests.push(Manifest::from_k8s(&build_consumer_deployment(
        &proxy, &bundle, config,
    ))?);
    Ok(manifests)
}
