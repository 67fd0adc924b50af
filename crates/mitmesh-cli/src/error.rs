//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A provisioning step or config validation failed
    #[error("{0}")]
    Provision(#[from] mitmesh_common::Error),

    /// Rendered manifests could not be serialized
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The config file could not be read or parsed
    #[error("failed to read config {path}: {message}")]
    ConfigFile {
        /// File that was being loaded
        path: PathBuf,
        /// Read or parse failure
        message: String,
    },
}

impl Error {
    /// Config file failure at `path`
    pub fn config_file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::ConfigFile {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Provisioning step the error was raised in, if any
    pub fn step(&self) -> Option<mitmesh_common::Step> {
        match self {
            Error::Provision(e) => e.step(),
            _ => None,
        }
    }
}
