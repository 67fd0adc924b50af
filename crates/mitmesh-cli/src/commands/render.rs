//! Render command - print the manifests of a run without applying them

use clap::{Args, ValueEnum};

use mitmesh_common::kube_utils::Manifest;
use mitmesh_provision::orchestrator::render_manifests;
use mitmesh_provision::{ClusterContext, ProvisionConfig, ServiceMeshKind};

use crate::Result;

/// Mesh to render policy objects for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum MeshArg {
    /// No mesh: base objects only
    #[default]
    None,
    /// Istio: namespace label plus routing and authorization objects
    Istio,
    /// Linkerd: namespace annotation only
    Linkerd,
}

impl From<MeshArg> for ServiceMeshKind {
    fn from(mesh: MeshArg) -> Self {
        match mesh {
            MeshArg::None => ServiceMeshKind::None,
            MeshArg::Istio => ServiceMeshKind::Istio,
            MeshArg::Linkerd => ServiceMeshKind::Linkerd,
        }
    }
}

/// Arguments of `render`; the cluster context is given, not resolved
#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Mesh the target namespace runs
    #[arg(long, value_enum, default_value_t = MeshArg::None)]
    pub mesh: MeshArg,

    /// Project used in the service identity's email
    #[arg(long, default_value = "my-project")]
    pub project: String,

    /// Cluster name
    #[arg(long, default_value = "my-cluster")]
    pub cluster: String,

    /// Cluster zone or region
    #[arg(long, default_value = "us-central1")]
    pub location: String,
}

/// Print every manifest a run would apply for `args.mesh`
pub fn run(args: RenderArgs, config: &ProvisionConfig) -> Result<()> {
    let context = ClusterContext {
        project_id: args.project,
        cluster_name: args.cluster,
        cluster_location: args.location,
    };
    let manifests = render_manifests(config, &context, args.mesh.into())?;
    print!("{}", to_yaml_stream(&manifests)?);
    Ok(())
}

/// Multi-document YAML, one document per manifest
pub fn to_yaml_stream(manifests: &[Manifest]) -> Result<String> {
    let mut docs = Vec::with_capacity(manifests.len());
    for manifest in manifests {
        docs.push(serde_yaml::to_string(&manifest.body)?);
    }
    Ok(docs
        .iter()
        .map(|doc| format!("---\n{}", doc))
        .collect::<String>())
}
