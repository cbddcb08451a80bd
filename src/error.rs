use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Generator or admission coverage for the running version is missing or
    /// ambiguous. Raised while building registries at boot.
    #[error("Configuration ambiguity: {0}")]
    ConfigurationAmbiguity(String),

    #[error("{kind} {namespace}/{name} not found")]
    ReferenceNotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("Concurrent modification of {0}")]
    ConcurrentModification(String),

    #[error("{0} was not found")]
    ResourceMissing(String),

    #[error("Webhook registration failed: {0}")]
    WebhookRegistration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reconcile error: {0}")]
    Reconcile(String),
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn reconcile(msg: impl Into<String>) -> Self {
        Self::Reconcile(msg.into())
    }
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn ambiguity(msg: impl Into<String>) -> Self {
        Self::ConfigurationAmbiguity(msg.into())
    }
    pub fn registration(msg: impl Into<String>) -> Self {
        Self::WebhookRegistration(msg.into())
    }
    pub fn reference_not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::ReferenceNotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Short CamelCase reason written into instance status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "KubernetesApiError",
            Error::Serde(_) => "SerializationError",
            Error::ConfigurationAmbiguity(_) => "ConfigurationAmbiguity",
            Error::ReferenceNotFound { .. } => "ReferenceNotFound",
            Error::ConcurrentModification(_) => "ConcurrentModification",
            Error::ResourceMissing(_) => "ResourceMissingUnexpectedly",
            Error::WebhookRegistration(_) => "WebhookRegistrationFailure",
            Error::Config(_) => "ConfigurationError",
            Error::Reconcile(_) => "ReconciliationFailed",
        }
    }

    /// Fatal errors stop the operator instead of being retried next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigurationAmbiguity(_) | Error::WebhookRegistration(_)
        )
    }

    /// Requeue delay for a failed reconcile cycle.
    pub fn requeue_delay(&self) -> Duration {
        match self {
            Error::ConcurrentModification(_) => Duration::from_secs(5),
            _ => Duration::from_secs(30),
        }
    }
}
