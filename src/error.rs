//! Error types for multicluster-dns.

use thiserror::Error;

/// Errors that can occur while running the DNS server or its watch controller.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Kubernetes client or watch error
    #[error("Kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    /// Failed to load kubeconfig
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// Failed to infer a kube client configuration
    #[error("Kubernetes config inference error: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Zone name could not be parsed
    #[error("Invalid zone: {0}")]
    InvalidZone(String),

    /// A second stop was requested while the first one is in effect
    #[error("shutdown already in progress")]
    AlreadyStopping,
}

/// Outcome classification for a failed record resolution.
///
/// The first three variants are name errors: they are answered with NXDOMAIN,
/// SERVFAIL or delegation depending on sync state and fallthrough. Anything
/// else ends up as SERVFAIL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The query name does not have a shape this server understands.
    #[error("invalid query name")]
    InvalidRequest,

    /// Nothing in the cache matches the query.
    #[error("no items found")]
    NoItems,

    /// The namespace named by the query is not present in the cache.
    #[error("namespace is not exposed")]
    NamespaceNotExposed,

    /// Any other failure, e.g. a malformed address in a cached object.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResolveError {
    /// True for errors that mean "this name does not exist here".
    pub fn is_name_error(&self) -> bool {
        matches!(
            self,
            ResolveError::InvalidRequest | ResolveError::NoItems | ResolveError::NamespaceNotExposed
        )
    }
}
