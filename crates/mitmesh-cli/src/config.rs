//! Provisioning configuration for a CLI invocation.
//!
//! Layers, lowest priority first:
//! 1. `ProvisionConfig::default()`
//! 2. A YAML file: `--config` / `MITMESH_CONFIG`, else
//!    `<config dir>/mitmesh/config.yaml` when it exists
//! 3. Individual flags (`--namespace`, `--ca-output`, `--trust-timeout-secs`)
//!
//! The merged result is validated before any command runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mitmesh_provision::ProvisionConfig;

use crate::{Error, GlobalArgs, Result};

const CONFIG_DIR_NAME: &str = "mitmesh";
const CONFIG_FILE_NAME: &str = "config.yaml";

/// `<config dir>/mitmesh/config.yaml`, if the platform has a config dir
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Pick the config file to load: the explicit one, or the default file if present.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    default_config_path().filter(|path| path.exists())
}

/// First entry of a (possibly list-valued) kubeconfig setting.
///
/// `KUBECONFIG` may hold several paths joined by the platform separator.
pub fn resolve_kubeconfig(value: Option<&Path>) -> Option<PathBuf> {
    value.and_then(|v| std::env::split_paths(v).find(|p| !p.as_os_str().is_empty()))
}

/// Parse a YAML config file. An empty file yields the defaults.
pub fn load_file(path: &Path) -> Result<ProvisionConfig> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::config_file(path, e.to_string()))?;
    if data.trim().is_empty() {
        return Ok(ProvisionConfig::default());
    }
    serde_yaml::from_str(&data).map_err(|e| Error::config_file(path, e.to_string()))
}

/// Overlay flag values on `config`
pub fn apply_overrides(config: &mut ProvisionConfig, args: &GlobalArgs) {
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(path) = &args.ca_output {
        config.ca_output = path.clone();
    }
    if let Some(secs) = args.trust_timeout_secs {
        config.trust_timeout = Duration::from_secs(secs);
    }
}

/// Build and validate the config for this invocation
pub fn build_config(args: &GlobalArgs) -> Result<ProvisionConfig> {
    let mut config = match resolve_config_path(args.config.as_deref()) {
        Some(path) => load_file(&path)?,
        None => ProvisionConfig::default(),
    };
    apply_overrides(&mut config, args);
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_overrides_subset_of_defaults() {
        let file = config_file("namespace: intercept\nproxyPort: 9090\ntrustTimeout: 60\n");
        let config = load_file(file.path()).unwrap();
        assert_eq!(config.namespace, "intercept");
        assert_eq!(config.proxy_port, 9090);
        assert_eq!(config.trust_timeout, Duration::from_secs(60));
        assert_eq!(config.secret_name, "mitmproxysecret");
    }

    #[test]
    fn empty_file_is_defaults() {
        let file = config_file("\n");
        assert_eq!(load_file(file.path()).unwrap(), ProvisionConfig::default());
    }

    #[test]
    fn malformed_file_names_the_path() {
        let file = config_file("proxyPort: [not, a, port]\n");
        let err = load_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigFile { ref path, .. } if path == file.path()));
    }

    #[test]
    fn flags_win_over_file() {
        let file = config_file("namespace: from-file\n");
        let args = GlobalArgs {
            config: Some(file.path().to_path_buf()),
            namespace: Some("from-flag".to_string()),
            ca_output: Some(PathBuf::from("/tmp/ca.pem")),
            trust_timeout_secs: Some(30),
            ..Default::default()
        };
        let config = build_config(&args).unwrap();
        assert_eq!(config.namespace, "from-flag");
        assert_eq!(config.ca_output, PathBuf::from("/tmp/ca.pem"));
        assert_eq!(config.trust_timeout, Duration::from_secs(30));
    }

    #[test]
    fn invalid_override_is_rejected() {
        let file = config_file("");
        let args = GlobalArgs {
            config: Some(file.path().to_path_buf()),
            namespace: Some("Not_A_Namespace".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            build_config(&args),
            Err(Error::Provision(mitmesh_common::Error::Config { .. }))
        ));
    }

    #[test]
    fn zero_trust_timeout_is_rejected() {
        let file = config_file("");
        let args = GlobalArgs {
            config: Some(file.path().to_path_buf()),
            trust_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = Path::new("/etc/mitmesh.yaml");
        assert_eq!(resolve_config_path(Some(path)), Some(path.to_path_buf()));
    }

    #[test]
    fn kubeconfig_list_uses_first_entry() {
        let joined = std::env::join_paths(["/a/config", "/b/config"]).unwrap();
        assert_eq!(
            resolve_kubeconfig(Some(Path::new(&joined))),
            Some(PathBuf::from("/a/config"))
        );
        assert_eq!(resolve_kubeconfig(None), None);
    }
}
