//! Telemetry transmission error taxonomy.
//!
//! The transmitter's retry loop matches on these variants to decide whether
//! an attempt may be retried, whether credentials must be invalidated first,
//! or whether the failure is terminal for the whole cycle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    /// No tenant base URL resolvable from any settings layer. Fatal for the
    /// attempt; the transmitter makes zero requests.
    #[error("no tenant base URL configured (set tenant_url in settings or managed policy)")]
    ConfigurationMissing,

    /// The identity provider declined to issue a token (not signed in,
    /// consent withheld, client id missing). Fatal for the attempt.
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),

    /// The server rejected the presented credential with HTTP 401.
    #[error("server rejected credentials (HTTP 401)")]
    AuthenticationRejected,

    /// HTTP 408, 429, or 5xx. Retried with backoff up to the attempt cap.
    #[error("server returned retryable status {status}")]
    RetryableServer { status: u16 },

    /// The request exceeded the configured timeout and was aborted.
    #[error("request timed out after {ms} ms")]
    Timeout { ms: u64 },

    /// Any other transport-level failure (DNS, connect, TLS, reset).
    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),

    /// The response could not be interpreted (bad header value, unreadable
    /// body).
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TelemetryError {
    /// Whether the retry loop may attempt again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationRejected
                | Self::RetryableServer { .. }
                | Self::Timeout { .. }
                | Self::Network(_)
        )
    }

    /// Short stable tag used in structured logs and persisted error records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing => "configuration-missing",
            Self::CredentialUnavailable(_) => "credential-unavailable",
            Self::AuthenticationRejected => "authentication-rejected",
            Self::RetryableServer { .. } => "retryable-server-error",
            Self::Timeout { .. } => "timeout",
            Self::Network(_) => "network-failure",
            Self::InvalidResponse(_) => "invalid-response",
        }
    }
}
