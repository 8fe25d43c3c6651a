//! Rejection bodies handed back to the routing layer.

use crate::policy::access::DenyCode;
use crate::TollgateError;
use serde::Serialize;

/// JSON body of a refused request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionBody {
    /// Machine-readable code, e.g. `freemium_expired`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Where the user can fix it; present on every access denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_url: Option<String>,
}

/// HTTP status plus body for a refused request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// HTTP status.
    pub status: u16,
    /// Body.
    pub body: RejectionBody,
}

impl Rejection {
    /// 403 for a user without the needed entitlement.
    pub fn forbidden(code: DenyCode, upgrade_url: &str) -> Self {
        Self {
            status: 403,
            body: RejectionBody {
                code: code.as_str().to_string(),
                message: code.message().to_string(),
                upgrade_url: Some(upgrade_url.to_string()),
            },
        }
    }

    /// Render an engine error. Infrastructure details are not echoed.
    pub fn from_error(error: &TollgateError, upgrade_url: &str) -> Self {
        let status = error.status_code();
        let message = if error.is_infrastructure() {
            "Service temporarily unavailable".to_string()
        } else {
            error.to_string()
        };
        Self {
            status,
            body: RejectionBody {
                code: error.code().to_string(),
                message,
                upgrade_url: (status == 403 && !upgrade_url.is_empty())
                    .then(|| upgrade_url.to_string()),
            },
        }
    }
}

impl From<TollgateError> for Rejection {
    fn from(error: TollgateError) -> Self {
        Self::from_error(&error, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_carries_upgrade_url() {
        let r = Rejection::forbidden(DenyCode::FreemiumExpired, "/subscriptions/plans");
        assert_eq!(r.status, 403);
        let json = serde_json::to_value(&r.body).unwrap();
        assert_eq!(json["code"], "freemium_expired");
        assert_eq!(json["upgrade_url"], "/subscriptions/plans");
    }

    #[test]
    fn test_unauthenticated_is_401_without_upgrade_url() {
        let r = Rejection::from_error(
            &TollgateError::Unauthenticated("Missing authorization header".into()),
            "/subscriptions/plans",
        );
        assert_eq!(r.status, 401);
        assert_eq!(r.body.code, "unauthenticated");
        assert!(r.body.upgrade_url.is_none());
    }

    #[test]
    fn test_quota_rejection_offers_upgrade() {
        let r = Rejection::from_error(&TollgateError::ScanQuotaExceeded, "/plans");
        assert_eq!(r.status, 403);
        assert_eq!(r.body.upgrade_url.as_deref(), Some("/plans"));
    }

    #[test]
    fn test_store_failure_is_not_echoed() {
        let r: Rejection = TollgateError::StoreError("disk full at /var/x".into()).into();
        assert_eq!(r.status, 500);
        assert!(!r.body.message.contains("/var/x"));
    }
}
