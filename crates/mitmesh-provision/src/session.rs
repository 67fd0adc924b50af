//! Cloud session seam
//!
//! [`CloudSession`] covers everything provisioning needs from the operator's
//! local cloud session: the active project, the active kube context, and the
//! IAM calls that create and bind the service identity.

use std::path::PathBuf;

use async_trait::async_trait;
use kube::config::Kubeconfig;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use mitmesh_common::retry::{retry_transient, RetryConfig};
use mitmesh_common::Error;

use crate::command;

/// Lowercased stderr fragments of gcloud failures that succeed on retry.
/// IAM policy writes race on the policy ETag when bindings change
/// concurrently.
const TRANSIENT_GCLOUD_ERRORS: [&str; 8] = [
    "concurrent policy changes",
    "etag",
    "unavailable",
    "deadline exceeded",
    "deadline_exceeded",
    "resource_exhausted",
    "rate limit",
    "try again",
];

/// Trait abstracting the operator's cloud session and IAM API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudSession: Send + Sync {
    /// Project configured in the active session, if any
    async fn active_project(&self) -> Result<Option<String>, Error>;

    /// Name of the active kube context, if any
    async fn current_kube_context(&self) -> Result<Option<String>, Error>;

    /// Create a service account.
    ///
    /// Returns [`Error::AlreadyExists`] when the account is already present.
    async fn create_service_account(
        &self,
        project: &str,
        name: &str,
        display_name: &str,
    ) -> Result<(), Error>;

    /// Grant `role` on `project` to `member` (e.g. `serviceAccount:x@p.iam...`)
    async fn add_project_binding(
        &self,
        project: &str,
        member: &str,
        role: &str,
    ) -> Result<(), Error>;
}

/// [`CloudSession`] backed by the `gcloud` CLI and the local kubeconfig
pub struct GcloudSession {
    kubeconfig: Option<PathBuf>,
    program: String,
    retry: RetryConfig,
}

impl GcloudSession {
    /// Create a session reading the given kubeconfig (or the default one)
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self {
            kubeconfig,
            program: "gcloud".to_string(),
            retry: RetryConfig::control_plane(),
        }
    }

    /// Run gcloud and return stdout, retrying failures it reports as
    /// temporary.
    async fn gcloud(&self, operation: &str, args: &[&str]) -> Result<String, Error> {
        let program = self.program.as_str();
        retry_transient(&self.retry, operation, || async move {
            let output = command::run(program, args, None).await?;
            if output.success {
                Ok(output.stdout)
            } else {
                Err(classify_failure(args, &output.stderr))
            }
        })
        .await
    }
}

/// Map a failed gcloud invocation to a retryable or permanent error
fn classify_failure(args: &[&str], stderr: &str) -> Error {
    let command = format!("gcloud {}", args.join(" "));
    let lowered = stderr.to_lowercase();
    if TRANSIENT_GCLOUD_ERRORS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        Error::command_unavailable(command, stderr.trim())
    } else {
        Error::command_failed(command, stderr.trim())
    }
}

/// Normalize `gcloud config get-value` output. An unset property prints
/// `(unset)` or nothing.
fn parse_config_value(stdout: &str) -> Option<String> {
    let value = stdout.trim();
    if value.is_empty() || value == "(unset)" {
        None
    } else {
        Some(value.to_string())
    }
}

#[async_trait]
impl CloudSession for GcloudSession {
    async fn active_project(&self) -> Result<Option<String>, Error> {
        let stdout = self
            .gcloud("get-project", &["config", "get-value", "project"])
            .await?;
        Ok(parse_config_value(&stdout))
    }

    async fn current_kube_context(&self) -> Result<Option<String>, Error> {
        let kubeconfig = match &self.kubeconfig {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        };
        match kubeconfig {
            Ok(config) => Ok(config.current_context.filter(|c| !c.is_empty())),
            Err(e) => {
                // No kubeconfig means no active session, not a failure
                debug!(error = %e, "no readable kubeconfig");
                Ok(None)
            }
        }
    }

    async fn create_service_account(
        &self,
        project: &str,
        name: &str,
        display_name: &str,
    ) -> Result<(), Error> {
        let display = format!("--display-name={}", display_name);
        let project_flag = format!("--project={}", project);
        let args = [
            "iam",
            "service-accounts",
            "create",
            name,
            display.as_str(),
            project_flag.as_str(),
        ];
        match self.gcloud("create-service-account", &args).await {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { message, .. }) if message.contains("already exists") => {
                Err(Error::already_exists("ServiceAccount", name))
            }
            Err(e) => Err(e),
        }
    }

    async fn add_project_binding(
        &self,
        project: &str,
        member: &str,
        role: &str,
    ) -> Result<(), Error> {
        let member_flag = format!("--member={}", member);
        let role_flag = format!("--role={}", role);
        // IAM bindings are a set, so re-adding is a no-op
        self.gcloud(
            "add-project-binding",
            &[
                "projects",
                "add-iam-policy-binding",
                project,
                member_flag.as_str(),
                role_flag.as_str(),
                "--condition=None",
                "--quiet",
            ],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;

    const CONCURRENT_CHANGE: &str = "ERROR: (gcloud.projects.add-iam-policy-binding) \
        There were concurrent policy changes. Please retry the whole read-modify-write \
        with exponential backoff.";

    /// Session running a stand-in gcloud that fails with `stderr` on the first
    /// `failures` calls. Calls are counted in `<dir>/calls`.
    #[cfg(unix)]
    fn scripted_session(dir: &Path, failures: u32, stderr: &str) -> GcloudSession {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("gcloud");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 calls=\"$(dirname \"$0\")/calls\"\n\
                 n=$(($(cat \"$calls\" 2>/dev/null || echo 0) + 1))\n\
                 echo $n > \"$calls\"\n\
                 if [ $n -le {failures} ]; then echo '{stderr}' >&2; exit 1; fi\n"
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        GcloudSession {
            kubeconfig: None,
            program: script.to_string_lossy().to_string(),
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
        }
    }

    #[cfg(unix)]
    fn calls(dir: &Path) -> u32 {
        std::fs::read_to_string(dir.join("calls"))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    #[test]
    fn temporary_gcloud_failures_are_retryable() {
        let args = ["projects", "add-iam-policy-binding", "proj-1"];
        assert!(classify_failure(&args, CONCURRENT_CHANGE).is_retryable());
        assert!(classify_failure(&args, "ERROR: 503 Service Unavailable").is_retryable());
        assert!(classify_failure(&args, "Deadline Exceeded").is_retryable());

        let denied = classify_failure(&args, "ERROR: PERMISSION_DENIED\n");
        assert!(!denied.is_retryable());
        match denied {
            Error::CommandFailed { command, message } => {
                assert_eq!(command, "gcloud projects add-iam-policy-binding proj-1");
                assert_eq!(message, "ERROR: PERMISSION_DENIED");
            }
            other => panic!("expected command failure, got {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_policy_change_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let session = scripted_session(dir.path(), 1, CONCURRENT_CHANGE);

        session
            .add_project_binding(
                "proj-1",
                "serviceAccount:mitmproxy-admin@proj-1.iam.gserviceaccount.com",
                "roles/container.admin",
            )
            .await
            .unwrap();
        assert_eq!(calls(dir.path()), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn permanent_gcloud_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let session = scripted_session(dir.path(), 5, "ERROR: PERMISSION_DENIED");

        let err = session
            .add_project_binding("proj-1", "user:a@b.c", "roles/viewer")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert_eq!(calls(dir.path()), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn existing_service_account_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let session = scripted_session(
            dir.path(),
            5,
            "ERROR: Service account mitmproxy-admin already exists within project",
        );

        let err = session
            .create_service_account("proj-1", "mitmproxy-admin", "mitmproxy admin")
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(calls(dir.path()), 1);
    }

    #[test]
    fn unset_project_is_none() {
        assert_eq!(parse_config_value("(unset)\n"), None);
        assert_eq!(parse_config_value("  \n"), None);
        assert_eq!(parse_config_value("my-proj\n"), Some("my-proj".to_string()));
    }

    #[tokio::test]
    async fn current_context_is_read_from_kubeconfig() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "apiVersion: v1\nkind: Config\ncurrent-context: gke_my-proj_us-central1_prod\n\
             clusters: []\ncontexts: []\nusers: []\n"
        )
        .unwrap();

        let session = GcloudSession::new(Some(file.path().to_path_buf()));
        assert_eq!(
            session.current_kube_context().await.unwrap().as_deref(),
            Some("gke_my-proj_us-central1_prod")
        );
    }

    #[tokio::test]
    async fn missing_kubeconfig_means_no_context() {
        let dir = tempfile::tempdir().unwrap();
        let session = GcloudSession::new(Some(dir.path().join("absent")));
        assert_eq!(session.current_kube_context().await.unwrap(), None);
    }
}
