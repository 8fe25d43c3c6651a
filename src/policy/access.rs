//! Access decisions and scan quota caps.
//!
//! An [`Access`] is a value, never an error: a user without entitlement
//! gets `granted = false` and `AccessType::None`.

use crate::store::{SubscriptionPlan, UserSubscription};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which entitlement source granted access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    /// A paid subscription.
    Subscription,
    /// The one-time trial subscription.
    Freemium,
    /// A redeemed product token.
    ProductToken,
    /// No entitlement.
    None,
}

impl AccessType {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Freemium => "freemium",
            Self::ProductToken => "product_token",
            Self::None => "none",
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved entitlement of one user at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    /// Whether any entitlement source applies.
    pub granted: bool,
    /// The source that applied.
    pub access_type: AccessType,
    /// Plan feature flags; empty for product tokens and denials.
    pub features: BTreeMap<String, bool>,
    /// When the granting source stops applying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Access {
    /// No entitlement.
    pub fn denied() -> Self {
        Self {
            granted: false,
            access_type: AccessType::None,
            features: BTreeMap::new(),
            expires_at: None,
        }
    }

    /// Access from an entitled subscription.
    pub fn from_subscription(
        subscription: &UserSubscription,
        plan: &SubscriptionPlan,
        freemium_plan_name: &str,
    ) -> Self {
        let access_type = if plan.name == freemium_plan_name {
            AccessType::Freemium
        } else {
            AccessType::Subscription
        };
        Self {
            granted: true,
            access_type,
            features: plan.features.clone(),
            expires_at: subscription.end_date,
        }
    }

    /// Access from a valid product token. Token access is not feature-gated.
    pub fn from_product_token(expires_at: DateTime<Utc>) -> Self {
        Self {
            granted: true,
            access_type: AccessType::ProductToken,
            features: BTreeMap::new(),
            expires_at: Some(expires_at),
        }
    }

    /// Whether `name` is switched on. Unknown features are off.
    pub fn has_feature(&self, name: &str) -> bool {
        self.granted && self.features.get(name).copied().unwrap_or(false)
    }
}

/// Why a gated request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCode {
    /// The user never had an entitlement.
    AccessRequired,
    /// The trial has run out.
    FreemiumExpired,
    /// A paid plan is needed (lapsed, or the plan lacks the feature).
    SubscriptionRequired,
}

impl DenyCode {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessRequired => "access_required",
            Self::FreemiumExpired => "freemium_expired",
            Self::SubscriptionRequired => "subscription_required",
        }
    }

    /// Default human-readable message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::AccessRequired => "A subscription or product token is required",
            Self::FreemiumExpired => "Your free trial has ended",
            Self::SubscriptionRequired => "An active subscription is required",
        }
    }
}

impl fmt::Display for DenyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scan quota on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCaps {
    /// Plan quota (None = unlimited).
    pub quota: Option<u32>,
    /// Scans counted so far.
    pub used: u32,
}

impl ScanCaps {
    /// Caps for a subscription under its plan.
    pub fn from_subscription(subscription: &UserSubscription, plan: &SubscriptionPlan) -> Self {
        Self {
            quota: plan.scan_quota,
            used: subscription.scans_used,
        }
    }

    /// Whether `additional` more scans fit.
    pub fn allows_usage(&self, additional: u32) -> bool {
        match self.quota {
            Some(quota) => u64::from(self.used) + u64::from(additional) <= u64::from(quota),
            None => true,
        }
    }

    /// Scans left, or `None` when unlimited.
    pub fn remaining(&self) -> Option<u32> {
        self.quota.map(|q| q.saturating_sub(self.used))
    }
}
