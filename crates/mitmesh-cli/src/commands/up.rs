//! Up command - the full provisioning run

use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;

use mitmesh_provision::{GcloudSession, LinkerdCli, Orchestrator, ProvisionConfig, RunReport};
use tracing::info;

use crate::Result;

/// Provision everything against the current cluster and print a summary
pub async fn run(config: ProvisionConfig, kubeconfig: Option<&Path>) -> Result<()> {
    let cluster = super::connect(kubeconfig).await?;
    let session = GcloudSession::new(kubeconfig.map(Path::to_path_buf));

    let orchestrator = Orchestrator::new(
        Arc::new(cluster),
        Arc::new(session),
        Arc::new(LinkerdCli::new()),
        config,
    );
    let report = orchestrator.run().await?;
    info!(cluster = %report.context, "provisioning complete");
    print!("{}", format_report(&report));
    Ok(())
}

/// Human-readable run summary
pub fn format_report(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "cluster:    {}", report.context);
    let _ = writeln!(
        out,
        "identity:   {} ({})",
        report.identity.value.email(),
        report.identity.outcome
    );
    let _ = writeln!(
        out,
        "namespace:  {} ({})",
        report.namespace.value, report.namespace.outcome
    );
    let _ = writeln!(out, "proxy:      {}", report.proxy.proxy_url());
    let _ = writeln!(
        out,
        "ca:         {} (sha256 {})",
        report.ca_path.display(),
        report.ca_hash
    );
    let _ = writeln!(
        out,
        "mesh:       {} ({} policy objects)",
        report.mesh, report.mesh_objects
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitmesh_provision::{
        ClusterContext, Ensured, Outcome, ProxyDeployment, ServiceIdentity, ServiceMeshKind,
    };
    use std::path::PathBuf;

    #[test]
    fn report_lists_every_step_result() {
        let config = ProvisionConfig::default();
        let report = RunReport {
            context: ClusterContext {
                project_id: "proj-1".to_string(),
                cluster_name: "edge".to_string(),
                cluster_location: "us-central1".to_string(),
            },
            identity: Ensured::new(
                ServiceIdentity {
                    name: "mitmproxy-admin".to_string(),
                    project_id: "proj-1".to_string(),
                },
                Outcome::Existing,
            ),
            namespace: Ensured::new("mitmproxy".to_string(), Outcome::Created),
            proxy: ProxyDeployment::from_config(&config, "mitmproxy"),
            ca_hash: "0123456789abcdef".to_string(),
            ca_path: PathBuf::from("mitmproxy-ca.pem"),
            mesh: ServiceMeshKind::Istio,
            mesh_objects: 3,
        };

        let text = format_report(&report);
        assert!(text.contains("mitmproxy-admin@proj-1.iam.gserviceaccount.com (existing)"));
        assert!(text.contains("namespace:  mitmproxy (created)"));
        assert!(text.contains("http://mitmproxy-svc.mitmproxy:8080/"));
        assert!(text.contains("istio (3 policy objects)"));
    }
}
