//! Error types for mitmesh provisioning
//!
//! Errors carry the context an operator needs to act on them: which namespace,
//! which pod, which external command. The orchestrator wraps component errors
//! in [`Error::Step`] so the final message names the failing step.

use std::fmt;

use thiserror::Error;

/// Provisioning step, used to label orchestrator failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Resolving project, cluster and location
    Context,
    /// Creating the service identity and its cluster-wide bindings
    Identity,
    /// Namespace, namespace admin binding and network policy
    Namespace,
    /// Mesh detection and namespace injection markers
    Neutralize,
    /// Proxy deployment and service
    Proxy,
    /// Mesh policy objects and sidecar re-injection
    Mesh,
    /// CA extraction, secret and trusting workload
    Trust,
}

impl Step {
    /// Short step name used in logs and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Context => "resolve-context",
            Step::Identity => "provision-identity",
            Step::Namespace => "bootstrap-namespace",
            Step::Neutralize => "neutralize-mesh",
            Step::Proxy => "deploy-proxy",
            Step::Mesh => "reconcile-mesh",
            Step::Trust => "propagate-trust",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for mitmesh operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The active project, cluster or location could not be determined
    #[error("unresolved cluster context: {message}")]
    UnresolvedContext {
        /// What was missing or ambiguous
        message: String,
    },

    /// The object already exists (absorbed by idempotent provisioning calls)
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind (e.g., "ServiceAccount")
        kind: String,
        /// Resource name
        name: String,
    },

    /// The proxy CA could not be extracted before the deadline
    #[error("trust extraction failed for {namespace}/{selector}: {message}")]
    TrustExtractionFailed {
        /// Namespace of the proxy
        namespace: String,
        /// Label selector of the proxy pods
        selector: String,
        /// Why extraction gave up
        message: String,
    },

    /// No deployment matched the label selector
    #[error("no deployment matching {selector} in namespace {namespace}")]
    DeploymentNotFound {
        /// Namespace searched
        namespace: String,
        /// Label selector used
        selector: String,
    },

    /// Mesh markers on the namespace could not be classified
    #[error("unknown service mesh in namespace {namespace}: {message}")]
    UnknownMesh {
        /// Namespace inspected
        namespace: String,
        /// Which markers were ambiguous
        message: String,
    },

    /// External command (gcloud, linkerd) failed
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command line that failed
        command: String,
        /// Captured stderr or spawn error
        message: String,
    },

    /// External command failed in a way that may succeed on retry
    #[error("command temporarily failed: {command}: {message}")]
    CommandUnavailable {
        /// The command line that failed
        command: String,
        /// Captured stderr
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// A wait exceeded its deadline
    #[error("timed out after {elapsed_secs}s waiting for {operation}: {message}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Seconds waited before giving up
        elapsed_secs: u64,
        /// Last observed reason the condition was not met
        message: String,
    },

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Local I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A provisioning step failed
    #[error("step {step} failed: {source}")]
    Step {
        /// The failing step
        step: Step,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an unresolved-context error
    pub fn unresolved_context(msg: impl Into<String>) -> Self {
        Self::UnresolvedContext {
            message: msg.into(),
        }
    }

    /// Create an already-exists conflict
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a trust extraction failure
    pub fn trust_extraction(
        namespace: impl Into<String>,
        selector: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::TrustExtractionFailed {
            namespace: namespace.into(),
            selector: selector.into(),
            message: msg.into(),
        }
    }

    /// Create a deployment-not-found error
    pub fn deployment_not_found(namespace: impl Into<String>, selector: impl Into<String>) -> Self {
        Self::DeploymentNotFound {
            namespace: namespace.into(),
            selector: selector.into(),
        }
    }

    /// Create an unknown-mesh error
    pub fn unknown_mesh(namespace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UnknownMesh {
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create a command failure
    pub fn command_failed(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a transient command failure
    pub fn command_unavailable(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CommandUnavailable {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Wrap this error with the step it occurred in
    pub fn in_step(self, step: Step) -> Self {
        match self {
            // Never double-wrap
            Error::Step { .. } => self,
            other => Error::Step {
                step,
                source: Box::new(other),
            },
        }
    }

    /// The step this error was raised in, if wrapped
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// The innermost error, unwrapping step context
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is an "already exists" conflict
    pub fn is_conflict(&self) -> bool {
        match self.root() {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Check if this error is worth retrying with backoff
    ///
    /// Only transient control-plane failures retry: transport errors, 5xx,
    /// 429 and commands that reported a temporary failure. Client errors and
    /// every domain error are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code >= 500 || ae.code == 429,
                kube::Error::HyperError(_) | kube::Error::Service(_) => true,
                _ => false,
            },
            Error::CommandUnavailable { .. } => true,
            Error::Step { source, .. } => source.is_retryable(),
            Error::UnresolvedContext { .. }
            | Error::AlreadyExists { .. }
            | Error::TrustExtractionFailed { .. }
            | Error::DeploymentNotFound { .. }
            | Error::UnknownMesh { .. }
            | Error::CommandFailed { .. }
            | Error::Serialization { .. }
            | Error::Timeout { .. }
            | Error::Config { .. }
            | Error::Io(_) => false,
        }
    }
}
