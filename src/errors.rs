//! Tollgate error types.
//!
//! Absence of access is never an error: the resolver returns
//! [`crate::Access`] with `granted = false`. The variants below cover
//! caller mistakes, lost races, rejected webhooks and infrastructure
//! failures.

use thiserror::Error;

/// Errors surfaced by the entitlement and reconciliation engine.
#[derive(Debug, Error)]
pub enum TollgateError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Bearer token missing, malformed, or expired.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// A user, token, plan, or subscription does not exist.
    #[error("{entity} not found")]
    NotFound {
        /// Kind of record that was looked up.
        entity: &'static str,
    },

    /// The user already holds an unexpired product token.
    #[error("User already has an active product token")]
    AlreadyHasToken,

    /// No unredeemed token matches the supplied code.
    #[error("Invalid or already used product token")]
    InvalidOrUsedToken,

    /// A uniqueness guard rejected a concurrent write.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Webhook signature did not match any accepted canonical form.
    #[error("Payment notification signature invalid")]
    InvalidSignature,

    /// The gateway answered, but with a non-success status.
    #[error("Payment gateway error: {0}")]
    GatewayError(String),

    /// The gateway could not be reached (network, TLS, timeout).
    #[error("Payment gateway transport error: {0}")]
    GatewayTransport(String),

    /// A payload could not be parsed.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The backing store failed.
    #[error("Store error: {0}")]
    StoreError(String),

    /// The active plan's scan quota is used up.
    #[error("Scan quota exceeded")]
    ScanQuotaExceeded,
}

impl TollgateError {
    /// HTTP status a routing layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthenticated(_) => 401,
            Self::ScanQuotaExceeded => 403,
            Self::NotFound { .. } => 404,
            Self::AlreadyHasToken | Self::Conflict(_) => 409,
            Self::InvalidOrUsedToken | Self::InvalidSignature | Self::ProtocolError(_) => 400,
            Self::GatewayError(_) | Self::GatewayTransport(_) => 502,
            Self::ConfigError(_) | Self::StoreError(_) => 500,
        }
    }

    /// Machine-readable code for rejection bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "config_error",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyHasToken => "already_has_token",
            Self::InvalidOrUsedToken => "invalid_or_used_token",
            Self::Conflict(_) => "conflict",
            Self::InvalidSignature => "invalid_signature",
            Self::GatewayError(_) => "gateway_error",
            Self::GatewayTransport(_) => "gateway_unavailable",
            Self::ProtocolError(_) => "bad_request",
            Self::StoreError(_) => "internal_error",
            Self::ScanQuotaExceeded => "scan_quota_exceeded",
        }
    }

    /// Whether the failure is infrastructure rather than a caller or policy outcome.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::GatewayTransport(_) | Self::StoreError(_) | Self::ConfigError(_)
        )
    }
}
