//! Cluster API seam
//!
//! [`ClusterApi`] is the only way components talk to the Kubernetes API
//! server. The real implementation wraps every request in bounded retry so
//! transient control-plane failures never surface as step failures.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{AttachParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::{Api, Client};
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use mitmesh_common::kube_utils::{is_pod_ready, Manifest};
use mitmesh_common::retry::{retry_transient, RetryConfig};
use mitmesh_common::{Error, FIELD_MANAGER};

use crate::mesh::NamespacePatch;
use crate::Outcome;

/// Trait abstracting the Kubernetes operations provisioning needs
///
/// This trait allows mocking the API server in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Server-side apply a manifest, reporting whether it existed before
    async fn apply(&self, manifest: &Manifest) -> Result<Outcome, Error>;

    /// Server-side apply under a specific field manager
    async fn apply_as(&self, manifest: &Manifest, field_manager: &str)
        -> Result<Outcome, Error>;

    /// Merge labels and annotations into an existing namespace
    async fn patch_namespace(&self, name: &str, patch: &NamespacePatch) -> Result<(), Error>;

    /// Get a namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Find the first deployment matching a label selector
    async fn find_deployment(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<Deployment>, Error>;

    /// Name of a Running and Ready pod matching a label selector
    async fn find_ready_pod(&self, namespace: &str, selector: &str)
        -> Result<Option<String>, Error>;

    /// Read a file from a container, `None` if it does not exist yet
    async fn read_pod_file(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterApi {
    client: Client,
    retry: RetryConfig,
}

impl KubeClusterApi {
    /// Create a new KubeClusterApi wrapping the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::control_plane(),
        }
    }

    fn dynamic_api(&self, manifest: &Manifest) -> Api<DynamicObject> {
        match &manifest.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &manifest.api_resource),
            None => Api::all_with(self.client.clone(), &manifest.api_resource),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn apply(&self, manifest: &Manifest) -> Result<Outcome, Error> {
        self.apply_as(manifest, FIELD_MANAGER).await
    }

    async fn apply_as(
        &self,
        manifest: &Manifest,
        field_manager: &str,
    ) -> Result<Outcome, Error> {
        let api = self.dynamic_api(manifest);
        let name = manifest.name.as_str();
        let key = manifest.key();

        let existing = retry_transient(&self.retry, &key, || {
            let api = api.clone();
            async move { api.get_opt(name).await.map_err(Error::from) }
        })
        .await?;

        let params = PatchParams::apply(field_manager).force();
        let body = &manifest.body;
        retry_transient(&self.retry, &key, || {
            let api = api.clone();
            let params = params.clone();
            async move {
                api.patch(name, &params, &Patch::Apply(body))
                    .await
                    .map_err(Error::from)
            }
        })
        .await?;

        let outcome = if existing.is_some() {
            Outcome::Existing
        } else {
            Outcome::Created
        };
        debug!(resource = %key, %outcome, field_manager, "applied");
        Ok(outcome)
    }

    async fn patch_namespace(&self, name: &str, patch: &NamespacePatch) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let body = serde_json::json!({
            "metadata": {
                "labels": patch.labels,
                "annotations": patch.annotations,
            }
        });
        retry_transient(&self.retry, "patch-namespace", || {
            let api = api.clone();
            let body = &body;
            async move {
                api.patch(name, &PatchParams::default(), &Patch::Merge(body))
                    .await
                    .map_err(Error::from)
            }
        })
        .await?;
        debug!(namespace = %name, "patched namespace metadata");
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        retry_transient(&self.retry, "get-namespace", || {
            let api = api.clone();
            async move { api.get_opt(name).await.map_err(Error::from) }
        })
        .await
    }

    async fn find_deployment(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        let list = retry_transient(&self.retry, "list-deployments", || {
            let api = api.clone();
            let lp = lp.clone();
            async move { api.list(&lp).await.map_err(Error::from) }
        })
        .await?;
        Ok(list.items.into_iter().next())
    }

    async fn find_ready_pod(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<String>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        let list = retry_transient(&self.retry, "list-pods", || {
            let api = api.clone();
            let lp = lp.clone();
            async move { api.list(&lp).await.map_err(Error::from) }
        })
        .await?;
        Ok(list
            .items
            .iter()
            .find(|pod| is_pod_ready(pod))
            .and_then(|pod| pod.metadata.name.clone()))
    }

    async fn read_pod_file(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(false);

        let mut attached = api.exec(pod, vec!["cat", path], &params).await?;

        let mut contents = Vec::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout.read_to_end(&mut contents).await?;
        }

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        let succeeded = status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .is_some_and(|s| s == "Success");

        if !succeeded {
            trace!(pod, path, ?status, "file not readable yet");
            return Ok(None);
        }
        Ok(Some(contents))
    }
}
