//! Persisted entities needed for entitlement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Payment method recorded on the one-time trial grant.
pub const FREEMIUM_PAYMENT_METHOD: &str = "freemium_trial";

/// Identity anchor for every entitlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Stable user id (JWT `sub`).
    pub id: Uuid,
    /// Login email.
    pub email: String,
    /// Whether the email has been verified.
    pub email_verified: bool,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// A single-use access code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductToken {
    /// Row id.
    pub id: Uuid,
    /// Redeemable code, unique across all tokens.
    pub code: String,
    /// Owner; `None` until redeemed.
    pub user_id: Option<Uuid>,
    /// When the token was redeemed.
    pub activated_at: Option<DateTime<Utc>>,
    /// Administrative switch.
    pub is_active: bool,
    /// Seeding time.
    pub created_at: DateTime<Utc>,
}

impl ProductToken {
    /// A fresh, unredeemed token.
    pub fn new(code: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            user_id: None,
            activated_at: None,
            is_active: true,
            created_at,
        }
    }

    /// A token is redeemable iff nobody owns it.
    pub fn is_redeemable(&self) -> bool {
        self.is_active && self.user_id.is_none()
    }

    /// Instant after which the token is expired, if redeemed.
    pub fn expires_at(&self, validity: chrono::Duration) -> Option<DateTime<Utc>> {
        self.activated_at.map(|at| at + validity)
    }

    /// Expired iff `now > activated_at + validity`. Unredeemed tokens never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>, validity: chrono::Duration) -> bool {
        self.expires_at(validity).is_some_and(|end| now > end)
    }
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    /// Row id.
    pub id: Uuid,
    /// Display name; the freemium plan is identified by name.
    pub name: String,
    /// Price in the smallest currency unit the gateway accepts.
    pub price: i64,
    /// Scans allowed per subscription period; `None` is unlimited.
    pub scan_quota: Option<u32>,
    /// Length of a subscription period.
    pub validity_days: u32,
    /// Feature name to enabled flag.
    pub features: BTreeMap<String, bool>,
    /// Whether the plan can be purchased.
    pub is_active: bool,
}

impl SubscriptionPlan {
    /// Build an active plan.
    pub fn new(name: impl Into<String>, price: i64, validity_days: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            price,
            scan_quota: None,
            validity_days,
            features: BTreeMap::new(),
            is_active: true,
        }
    }

    /// Builder-style feature flag.
    pub fn with_feature(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.features.insert(name.into(), enabled);
        self
    }

    /// Builder-style scan quota.
    pub fn with_scan_quota(mut self, quota: u32) -> Self {
        self.scan_quota = Some(quota);
        self
    }

    /// Period length as a chrono duration.
    pub fn validity(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.validity_days))
    }
}

/// Settlement state of a subscription's payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Waiting on the gateway.
    Pending,
    /// Paid (or granted for free).
    Completed,
    /// Denied, cancelled, expired, or refunded.
    Failed,
}

impl PaymentStatus {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// The entitlement-bearing subscription instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSubscription {
    /// Row id.
    pub id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    /// Purchased plan.
    pub plan_id: Uuid,
    /// Period start; unset until payment settles.
    pub start_date: Option<DateTime<Utc>>,
    /// Period end; unset until payment settles.
    pub end_date: Option<DateTime<Utc>>,
    /// At most one row per user carries `true`.
    pub is_active: bool,
    /// e.g. `"gopay"` or [`FREEMIUM_PAYMENT_METHOD`].
    pub payment_method: String,
    /// Merchant order id sent to the gateway; unique when set.
    pub order_id: Option<String>,
    /// Gateway transaction handle.
    pub transaction_id: Option<String>,
    /// Payment state.
    pub payment_status: PaymentStatus,
    /// Scans consumed in this period.
    pub scans_used: u32,
    /// Row creation.
    pub created_at: DateTime<Utc>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
}

impl UserSubscription {
    /// Entitled iff flagged active and `now < end_date`.
    ///
    /// A row can stay flagged active after its end date; that is a valid
    /// transient state and is simply not entitled.
    pub fn is_entitled_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.end_date.is_some_and(|end| now < end)
    }

    /// Whether this row is the trial grant.
    pub fn is_freemium(&self) -> bool {
        self.payment_method == FREEMIUM_PAYMENT_METHOD
    }

    /// Never activated: no period recorded and payment not completed.
    pub fn is_awaiting_activation(&self) -> bool {
        self.start_date.is_none()
            && self.end_date.is_none()
            && matches!(
                self.payment_status,
                PaymentStatus::Pending | PaymentStatus::Failed
            )
    }
}

/// Audit record of gateway status payloads for one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDetail {
    /// Row id.
    pub id: Uuid,
    /// Merchant order id; unique.
    pub order_id: String,
    /// Subscription the order belongs to, if known.
    pub subscription_id: Option<Uuid>,
    /// Gateway transaction id.
    pub transaction_id: Option<String>,
    /// Gateway `transaction_status`.
    pub transaction_status: String,
    /// Gateway `status_code`.
    pub status_code: String,
    /// Gateway `fraud_status`.
    pub fraud_status: Option<String>,
    /// Gateway `payment_type`.
    pub payment_type: Option<String>,
    /// Gateway `gross_amount`.
    pub gross_amount: Option<String>,
    /// Gateway `settlement_time`; once set the settlement fields are frozen.
    pub settlement_time: Option<String>,
    /// Authoritative status payload as received.
    pub raw: serde_json::Value,
    /// Number of deliveries folded into this row.
    pub delivery_count: u32,
    /// First delivery.
    pub received_at: DateTime<Utc>,
    /// Latest delivery.
    pub updated_at: DateTime<Utc>,
}

impl TransactionDetail {
    /// Whether settlement fields have been recorded.
    pub fn is_settled(&self) -> bool {
        self.settlement_time.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_token_expiry_boundary() {
        let mut token = ProductToken::new("ABC123", at(1));
        let validity = chrono::Duration::days(10);
        assert!(!token.is_expired_at(at(30), validity));

        token.user_id = Some(Uuid::new_v4());
        token.activated_at = Some(at(1));
        assert!(!token.is_expired_at(at(11), validity));
        assert!(token.is_expired_at(at(11) + chrono::Duration::seconds(1), validity));
    }

    #[test]
    fn test_token_redeemable_requires_no_owner() {
        let mut token = ProductToken::new("ABC123", at(1));
        assert!(token.is_redeemable());
        token.user_id = Some(Uuid::new_v4());
        assert!(!token.is_redeemable());
    }

    #[test]
    fn test_subscription_entitlement_window() {
        let sub = UserSubscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            start_date: Some(at(1)),
            end_date: Some(at(15)),
            is_active: true,
            payment_method: FREEMIUM_PAYMENT_METHOD.to_string(),
            order_id: None,
            transaction_id: None,
            payment_status: PaymentStatus::Completed,
            scans_used: 0,
            created_at: at(1),
            updated_at: at(1),
        };

        assert!(sub.is_entitled_at(at(14)));
        assert!(!sub.is_entitled_at(at(15)));
        assert!(sub.is_freemium());

        let pending = UserSubscription {
            end_date: None,
            ..sub
        };
        assert!(!pending.is_entitled_at(at(2)));
        assert!(!pending.is_awaiting_activation());

        let fresh = UserSubscription {
            start_date: None,
            payment_status: PaymentStatus::Pending,
            ..pending
        };
        assert!(fresh.is_awaiting_activation());
    }

    #[test]
    fn test_payment_status_serializes_lowercase() {
        let json = serde_json::to_string(&PaymentStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
