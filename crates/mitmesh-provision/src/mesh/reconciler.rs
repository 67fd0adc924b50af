//! Mesh policy reconciliation
//!
//! One branch per [`ServiceMeshKind`], matched exhaustively:
//!
//! - Istio: disable injection, route the mesh ingress to the proxy through a
//!   Gateway and VirtualService, allow all traffic with an AuthorizationPolicy
//! - Linkerd: disable namespace injection, then re-inject the proxy
//!   Deployment explicitly (disabling namespace injection does not touch an
//!   existing pod template)
//! - None: nothing
//! - Unknown: surfaced as [`Error::UnknownMesh`]
//!
//! Namespace markers go on before the proxy is deployed
//! ([`MeshPolicyReconciler::neutralize_namespace`]) so the proxy pod is
//! admitted without a mesh sidecar. The rest is applied once the proxy
//! exists. The injected Deployment is applied under
//! [`INJECTION_FIELD_MANAGER`]: a later re-apply of the base proxy under
//! [`FIELD_MANAGER`] leaves the sidecar in place and the pod template
//! unchanged.

use std::collections::BTreeMap;

use tracing::{debug, info};

use mitmesh_common::kube_utils::{strip_export_metadata, ObjectMeta};
use mitmesh_common::mesh::{
    ServiceMeshKind, INJECTION_DISABLED, ISTIO_INGRESS_SELECTOR_KEY, ISTIO_INGRESS_SELECTOR_VALUE,
    ISTIO_INJECTION_LABEL, LINKERD_INJECT_ANNOTATION, LINKERD_PROXY_CONTAINER,
    NEUTRALIZED_MESH_ANNOTATION,
};
use mitmesh_common::policy::{
    AuthorizationPolicy, Destination, Gateway, GatewayPort, GatewayServer, GatewaySpec,
    HttpMatchRequest, HttpRoute, HttpRouteDestination, PortSelector, StringMatch, VirtualService,
    VirtualServiceSpec,
};
use mitmesh_common::{Error, FIELD_MANAGER, INJECTION_FIELD_MANAGER};

use super::{MeshPolicySet, NamespacePatch};
use crate::client::ClusterApi;
use crate::injector::SidecarInjector;
use crate::proxy::ProxyDeployment;

/// Port the Istio Gateway listens on
const GATEWAY_HTTP_PORT: u16 = 80;

/// Injection-disable marker plus the neutralization record for `kind`
pub fn neutralization_patch(kind: ServiceMeshKind) -> NamespacePatch {
    let mut patch = NamespacePatch::default();
    match kind {
        ServiceMeshKind::Istio => {
            patch
                .labels
                .insert(ISTIO_INJECTION_LABEL.to_string(), INJECTION_DISABLED.to_string());
        }
        ServiceMeshKind::Linkerd => {
            patch.annotations.insert(
                LINKERD_INJECT_ANNOTATION.to_string(),
                INJECTION_DISABLED.to_string(),
            );
        }
        ServiceMeshKind::None | ServiceMeshKind::Unknown => return patch,
    }
    patch.annotations.insert(
        NEUTRALIZED_MESH_ANNOTATION.to_string(),
        kind.as_str().to_string(),
    );
    patch
}

/// Istio Gateway, VirtualService and AuthorizationPolicy for `proxy`
pub fn istio_policy_set(proxy: &ProxyDeployment) -> MeshPolicySet {
    let namespace = &proxy.namespace;
    let gateway_name = format!("{}-gateway", proxy.app_label);

    let gateway = Gateway::new(
        ObjectMeta::new(&gateway_name, namespace),
        GatewaySpec {
            selector: BTreeMap::from([(
                ISTIO_INGRESS_SELECTOR_KEY.to_string(),
                ISTIO_INGRESS_SELECTOR_VALUE.to_string(),
            )]),
            servers: vec![GatewayServer {
                port: GatewayPort {
                    number: GATEWAY_HTTP_PORT,
                    name: "http".to_string(),
                    protocol: "HTTP".to_string(),
                },
                hosts: vec!["*".to_string()],
            }],
        },
    );

    let virtual_service = VirtualService::new(
        ObjectMeta::new(format!("{}-vs", proxy.app_label), namespace),
        VirtualServiceSpec {
            hosts: vec!["*".to_string()],
            gateways: vec![gateway_name],
            http: vec![HttpRoute {
                matches: vec![HttpMatchRequest {
                    uri: StringMatch {
                        prefix: "/".to_string(),
                    },
                }],
                route: vec![HttpRouteDestination {
                    destination: Destination {
                        host: proxy.service_fqdn(),
                        port: PortSelector { number: proxy.port },
                    },
                }],
            }],
        },
    );

    let authorization_policy = AuthorizationPolicy::allow_all(
        ObjectMeta::new(format!("{}-allow-all", proxy.app_label), namespace),
        proxy.selector_labels(),
    );

    MeshPolicySet::Istio {
        namespace_patch: neutralization_patch(ServiceMeshKind::Istio),
        gateway,
        virtual_service,
        authorization_policy,
    }
}

fn unclassified(namespace: &str) -> Error {
    Error::unknown_mesh(
        namespace,
        "injection markers could not be classified; fix the namespace labels \
         and annotations and re-run",
    )
}

/// Plans and applies the policy set for a detected mesh
pub struct MeshPolicyReconciler<'a> {
    cluster: &'a dyn ClusterApi,
    injector: &'a dyn SidecarInjector,
}

impl<'a> MeshPolicyReconciler<'a> {
    /// Create a reconciler over the given seams
    pub fn new(cluster: &'a dyn ClusterApi, injector: &'a dyn SidecarInjector) -> Self {
        Self { cluster, injector }
    }

    /// Write only the injection markers for `kind` into `namespace`.
    ///
    /// Runs before the proxy is deployed. An unknown mesh fails here, before
    /// anything is scheduled into the namespace.
    pub async fn neutralize_namespace(
        &self,
        kind: ServiceMeshKind,
        namespace: &str,
    ) -> Result<(), Error> {
        if kind == ServiceMeshKind::Unknown {
            return Err(unclassified(namespace));
        }
        let patch = neutralization_patch(kind);
        if patch == NamespacePatch::default() {
            return Ok(());
        }
        self.cluster.patch_namespace(namespace, &patch).await?;
        info!(namespace = %namespace, mesh = %kind, "disabled namespace injection");
        Ok(())
    }

    /// Build the policy set for `kind`. Reads the cluster but never writes.
    pub async fn plan(
        &self,
        kind: ServiceMeshKind,
        proxy: &ProxyDeployment,
    ) -> Result<MeshPolicySet, Error> {
        match kind {
            ServiceMeshKind::Istio => Ok(istio_policy_set(proxy)),
            ServiceMeshKind::Linkerd => self.plan_linkerd(proxy).await,
            ServiceMeshKind::None => Ok(MeshPolicySet::Empty),
            ServiceMeshKind::Unknown => Err(unclassified(&proxy.namespace)),
        }
    }

    async fn plan_linkerd(&self, proxy: &ProxyDeployment) -> Result<MeshPolicySet, Error> {
        let selector = proxy.selector();
        let mut deployment = self
            .cluster
            .find_deployment(&proxy.namespace, &selector)
            .await?
            .ok_or_else(|| Error::deployment_not_found(&proxy.namespace, &selector))?;

        strip_export_metadata(&mut deployment.metadata);
        deployment.status = None;

        let injected = self.injector.inject(&deployment).await?;
        let has_sidecar = injected
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .is_some_and(|pod| {
                pod.containers
                    .iter()
                    .chain(pod.init_containers.iter().flatten())
                    .any(|c| c.name == LINKERD_PROXY_CONTAINER)
            });
        if !has_sidecar {
            return Err(Error::command_failed(
                "linkerd inject",
                format!("output has no {} container", LINKERD_PROXY_CONTAINER),
            ));
        }

        Ok(MeshPolicySet::Linkerd {
            namespace_patch: neutralization_patch(ServiceMeshKind::Linkerd),
            deployment: Box::new(injected),
        })
    }

    /// Write a policy set into `namespace`: namespace markers first, then
    /// every object as a full overwrite.
    pub async fn apply(&self, set: &MeshPolicySet, namespace: &str) -> Result<(), Error> {
        if let Some(patch) = set.namespace_patch() {
            self.cluster.patch_namespace(namespace, patch).await?;
            debug!(namespace = %namespace, mesh = %set.kind(), "disabled namespace injection");
        }
        let field_manager = match set {
            MeshPolicySet::Linkerd { .. } => INJECTION_FIELD_MANAGER,
            MeshPolicySet::Istio { .. } | MeshPolicySet::Empty => FIELD_MANAGER,
        };
        for manifest in set.manifests()? {
            let outcome = self.cluster.apply_as(&manifest, field_manager).await?;
            info!(resource = %manifest.key(), %outcome, field_manager, "applied mesh policy");
        }
        Ok(())
    }

    /// Plan and apply in one step, returning what was applied
    pub async fn reconcile(
        &self,
        kind: ServiceMeshKind,
        proxy: &ProxyDeployment,
    ) -> Result<MeshPolicySet, Error> {
        let set = self.plan(kind, proxy).await?;
        self.apply(&set, &proxy.namespace).await?;
        info!(namespace = %proxy.namespace, mesh = %kind, "mesh reconciled");
        Ok(set)
    }
}
