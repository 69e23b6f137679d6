use crate::engine::config::ConfigError;
use crate::engine::session::SessionId;

/// Engine lifecycle and channel errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Engine is not running")]
    NotRunning,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Outcome classification of policy lookups and negotiation.
///
/// Transport failures never show up here directly; they are downgraded to
/// [`PolicyError::PolicyServiceNotProvided`] at the negotiation boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// A policy is stored but the enforcement cookie is missing. The cookie has been
    /// rewritten and the caller should reload once.
    #[error("cookie policy for {origin} is not set in the browser")]
    PolicyNotSet { origin: String },

    #[error("no cookie policy stored for {origin}")]
    PolicyNotFound { origin: String },

    #[error("{origin} does not provide a cookie policy service: {reason}")]
    PolicyServiceNotProvided { origin: String, reason: String },

    #[error("policy scope {scope} does not cover {visited}")]
    InvalidScope { visited: String, scope: String },
}

/// Persistence backend failures. The policy store logs these and carries on.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),
}

/// Failures of the policy service transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("Invalid response body: {0}")]
    InvalidBody(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Request(e.to_string())
    }
}

/// Cookie jar failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CookieError {
    #[error("cookie domain {domain} does not match host {host}")]
    DomainMismatch { domain: String, host: String },

    #[error("url {0} has no host")]
    NoHost(String),
}
