//! In-process table set shared by the memory and file stores.
//!
//! Each mutating method is one transaction: callers hold the write lock
//! for the whole call, and every uniqueness rule is checked inside it.
//! Mutators run all checks before touching any row, so an `Err` leaves
//! the tables unchanged.

use crate::policy::access::ScanCaps;
use crate::store::entities::{
    PaymentStatus, ProductToken, SubscriptionPlan, TransactionDetail, User, UserSubscription,
};
use crate::store::{EntitlementStore, SubscriptionTransition};
use crate::TollgateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// All entitlement tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tables {
    /// `users`
    #[serde(default)]
    pub users: HashMap<Uuid, User>,
    /// `product_tokens`
    #[serde(default)]
    pub product_tokens: HashMap<Uuid, ProductToken>,
    /// `subscription_plans`
    #[serde(default)]
    pub subscription_plans: HashMap<Uuid, SubscriptionPlan>,
    /// `user_subscriptions`
    #[serde(default)]
    pub user_subscriptions: HashMap<Uuid, UserSubscription>,
    /// `transaction_details`, keyed by order id
    #[serde(default)]
    pub transaction_details: HashMap<String, TransactionDetail>,
}

impl Tables {
    pub(crate) fn token_for_user(&self, user_id: Uuid) -> Option<ProductToken> {
        self.product_tokens
            .values()
            .find(|t| t.user_id == Some(user_id))
            .cloned()
    }

    pub(crate) fn token_by_code(&self, code: &str) -> Option<ProductToken> {
        self.product_tokens.values().find(|t| t.code == code).cloned()
    }

    pub(crate) fn insert_token(&mut self, token: ProductToken) -> Result<(), TollgateError> {
        if self.product_tokens.values().any(|t| t.code == token.code) {
            return Err(TollgateError::Conflict(format!(
                "product token code already exists: {}",
                token.code
            )));
        }
        self.product_tokens.insert(token.id, token);
        Ok(())
    }

    pub(crate) fn redeem_token(
        &mut self,
        user_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
        validity: chrono::Duration,
    ) -> Result<ProductToken, TollgateError> {
        let held = self.token_for_user(user_id);
        if held.as_ref().is_some_and(|t| !t.is_expired_at(now, validity)) {
            return Err(TollgateError::AlreadyHasToken);
        }

        let token_id = self
            .product_tokens
            .values()
            .find(|t| t.code == code && t.is_redeemable())
            .map(|t| t.id)
            .ok_or(TollgateError::InvalidOrUsedToken)?;

        // Lazy GC of the user's expired token.
        if let Some(expired) = held {
            self.product_tokens.remove(&expired.id);
        }

        let token = self
            .product_tokens
            .get_mut(&token_id)
            .ok_or(TollgateError::InvalidOrUsedToken)?;
        token.user_id = Some(user_id);
        token.activated_at = Some(now);
        Ok(token.clone())
    }

    pub(crate) fn delete_token_if_expired(
        &mut self,
        token_id: Uuid,
        now: DateTime<Utc>,
        validity: chrono::Duration,
    ) -> bool {
        let expired = self
            .product_tokens
            .get(&token_id)
            .is_some_and(|t| t.is_expired_at(now, validity));
        if expired {
            self.product_tokens.remove(&token_id);
        }
        expired
    }

    pub(crate) fn plan_by_name(&self, name: &str) -> Option<SubscriptionPlan> {
        self.subscription_plans
            .values()
            .find(|p| p.name == name)
            .cloned()
    }

    pub(crate) fn subscriptions_for_user(&self, user_id: Uuid) -> Vec<UserSubscription> {
        let mut rows: Vec<UserSubscription> = self
            .user_subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows
    }

    pub(crate) fn subscription_by_order(&self, order_id: &str) -> Option<UserSubscription> {
        self.user_subscriptions
            .values()
            .find(|s| s.order_id.as_deref() == Some(order_id))
            .cloned()
    }

    /// Switch off the user's rows created no later than `current`.
    fn deactivate_older(&mut self, current: &UserSubscription, now: DateTime<Utc>) {
        for sub in self.user_subscriptions.values_mut() {
            if sub.user_id == current.user_id
                && sub.id != current.id
                && sub.is_active
                && sub.created_at <= current.created_at
            {
                sub.is_active = false;
                sub.updated_at = now;
            }
        }
    }

    fn deactivate_others(&mut self, user_id: Uuid, keep: Uuid, now: DateTime<Utc>) -> usize {
        let mut count = 0;
        for sub in self.user_subscriptions.values_mut() {
            if sub.user_id == user_id && sub.id != keep && sub.is_active {
                sub.is_active = false;
                sub.updated_at = now;
                count += 1;
            }
        }
        count
    }

    pub(crate) fn insert_superseding(
        &mut self,
        subscription: UserSubscription,
        now: DateTime<Utc>,
    ) -> Result<UserSubscription, TollgateError> {
        if let Some(order_id) = subscription.order_id.as_deref() {
            if self.subscription_by_order(order_id).is_some() {
                return Err(TollgateError::Conflict(format!(
                    "order id already used: {}",
                    order_id
                )));
            }
        }

        let superseded = self.deactivate_others(subscription.user_id, subscription.id, now);
        if superseded > 0 {
            tracing::info!(
                user_id = %subscription.user_id,
                superseded,
                "deactivated previous subscription"
            );
        }
        self.user_subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    pub(crate) fn insert_freemium_if_absent(
        &mut self,
        subscription: UserSubscription,
    ) -> Option<UserSubscription> {
        let exists = self
            .user_subscriptions
            .values()
            .any(|s| s.user_id == subscription.user_id);
        if exists {
            return None;
        }
        self.user_subscriptions
            .insert(subscription.id, subscription.clone());
        Some(subscription)
    }

    /// Apply a gateway transition to the row carrying `order_id`.
    ///
    /// `Activate` only takes effect on a row that never ran: no dates set and
    /// payment still pending or failed. A re-delivered settlement for a row
    /// that already ran is `Unchanged`. Activation switches off the user's
    /// older rows only; when a newer row is already active the settled row
    /// is marked completed but stays off.
    pub(crate) fn apply_transition(
        &mut self,
        order_id: &str,
        transition: SubscriptionTransition,
        now: DateTime<Utc>,
    ) -> Result<UserSubscription, TollgateError> {
        let current = self
            .subscription_by_order(order_id)
            .ok_or(TollgateError::NotFound {
                entity: "Subscription",
            })?;

        let transition = match transition {
            SubscriptionTransition::Activate { .. } if !current.is_awaiting_activation() => {
                tracing::debug!(order_id, "settlement for a row that already ran ignored");
                SubscriptionTransition::Unchanged
            }
            other => other,
        };

        let superseded_by_newer = self.user_subscriptions.values().any(|s| {
            s.user_id == current.user_id && s.is_active && s.created_at > current.created_at
        });

        let mut updated = current.clone();
        match transition {
            SubscriptionTransition::Activate { .. } if superseded_by_newer => {
                tracing::info!(
                    order_id,
                    user_id = %current.user_id,
                    "late settlement for superseded order left inactive"
                );
                updated.payment_status = PaymentStatus::Completed;
            }
            SubscriptionTransition::Activate { start, end } => {
                self.deactivate_older(&current, now);
                updated.payment_status = PaymentStatus::Completed;
                updated.is_active = true;
                updated.start_date = Some(start);
                updated.end_date = Some(end);
            }
            SubscriptionTransition::Deactivate => {
                updated.payment_status = PaymentStatus::Failed;
                updated.is_active = false;
            }
            SubscriptionTransition::Unchanged => {}
        }

        // Replays leave the row untouched, timestamps included.
        if updated != current {
            updated.updated_at = now;
            self.user_subscriptions.insert(updated.id, updated.clone());
        }
        Ok(updated)
    }

    /// Apply a transition and fold the delivery into its detail row as one
    /// change. The transition runs first; if it fails, no detail is written.
    pub(crate) fn record_delivery(
        &mut self,
        detail: TransactionDetail,
        transition: Option<SubscriptionTransition>,
        now: DateTime<Utc>,
    ) -> Result<(TransactionDetail, Option<UserSubscription>), TollgateError> {
        let subscription = match transition {
            Some(transition) => Some(self.apply_transition(&detail.order_id, transition, now)?),
            None => None,
        };
        Ok((self.upsert_transaction_detail(detail), subscription))
    }

    pub(crate) fn increment_scan_usage(
        &mut self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UserSubscription, TollgateError> {
        let sub = self
            .user_subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.is_entitled_at(now))
            .ok_or(TollgateError::NotFound {
                entity: "Active subscription",
            })?;
        let plan = self
            .subscription_plans
            .get(&sub.plan_id)
            .ok_or(TollgateError::NotFound {
                entity: "Subscription plan",
            })?;

        if !ScanCaps::from_subscription(sub, plan).allows_usage(1) {
            return Err(TollgateError::ScanQuotaExceeded);
        }

        let mut sub = sub.clone();
        sub.scans_used += 1;
        sub.updated_at = now;
        self.user_subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    pub(crate) fn upsert_transaction_detail(
        &mut self,
        detail: TransactionDetail,
    ) -> TransactionDetail {
        let merged = match self.transaction_details.get(&detail.order_id) {
            Some(existing) if existing.is_settled() => TransactionDetail {
                delivery_count: existing.delivery_count + 1,
                updated_at: detail.updated_at,
                subscription_id: existing.subscription_id.or(detail.subscription_id),
                ..existing.clone()
            },
            Some(existing) => TransactionDetail {
                id: existing.id,
                received_at: existing.received_at,
                delivery_count: existing.delivery_count + 1,
                subscription_id: detail.subscription_id.or(existing.subscription_id),
                ..detail
            },
            None => detail,
        };
        self.transaction_details
            .insert(merged.order_id.clone(), merged.clone());
        merged
    }
}

/// Locked access to a [`Tables`] set.
///
/// `write` runs the closure as one transaction: either every change it
/// makes is committed, or none is.
pub trait TableAccess: Send + Sync {
    /// Run a read-only closure against a consistent snapshot.
    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, TollgateError>;

    /// Run a mutating closure as one transaction.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, TollgateError>,
    ) -> Result<T, TollgateError>;
}

impl<S: TableAccess> EntitlementStore for S {
    fn get_user(&self, user_id: Uuid) -> Result<Option<User>, TollgateError> {
        self.read(|t| t.users.get(&user_id).cloned())
    }

    fn put_user(&self, user: User) -> Result<(), TollgateError> {
        self.write(|t| {
            t.users.insert(user.id, user);
            Ok(())
        })
    }

    fn insert_token(&self, token: ProductToken) -> Result<(), TollgateError> {
        self.write(|t| t.insert_token(token))
    }

    fn token_for_user(&self, user_id: Uuid) -> Result<Option<ProductToken>, TollgateError> {
        self.read(|t| t.token_for_user(user_id))
    }

    fn token_by_code(&self, code: &str) -> Result<Option<ProductToken>, TollgateError> {
        self.read(|t| t.token_by_code(code))
    }

    fn redeem_token(
        &self,
        user_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
        validity: chrono::Duration,
    ) -> Result<ProductToken, TollgateError> {
        self.write(|t| t.redeem_token(user_id, code, now, validity))
    }

    fn delete_token_if_expired(
        &self,
        token_id: Uuid,
        now: DateTime<Utc>,
        validity: chrono::Duration,
    ) -> Result<bool, TollgateError> {
        self.write(|t| Ok(t.delete_token_if_expired(token_id, now, validity)))
    }

    fn put_plan(&self, plan: SubscriptionPlan) -> Result<(), TollgateError> {
        self.write(|t| {
            t.subscription_plans.insert(plan.id, plan);
            Ok(())
        })
    }

    fn get_plan(&self, plan_id: Uuid) -> Result<Option<SubscriptionPlan>, TollgateError> {
        self.read(|t| t.subscription_plans.get(&plan_id).cloned())
    }

    fn plan_by_name(&self, name: &str) -> Result<Option<SubscriptionPlan>, TollgateError> {
        self.read(|t| t.plan_by_name(name))
    }

    fn list_plans(&self) -> Result<Vec<SubscriptionPlan>, TollgateError> {
        self.read(|t| t.subscription_plans.values().cloned().collect())
    }

    fn subscriptions_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<UserSubscription>, TollgateError> {
        self.read(|t| t.subscriptions_for_user(user_id))
    }

    fn subscription_by_order(
        &self,
        order_id: &str,
    ) -> Result<Option<UserSubscription>, TollgateError> {
        self.read(|t| t.subscription_by_order(order_id))
    }

    fn insert_superseding(
        &self,
        subscription: UserSubscription,
        now: DateTime<Utc>,
    ) -> Result<UserSubscription, TollgateError> {
        self.write(|t| t.insert_superseding(subscription, now))
    }

    fn insert_freemium_if_absent(
        &self,
        subscription: UserSubscription,
    ) -> Result<Option<UserSubscription>, TollgateError> {
        self.write(|t| Ok(t.insert_freemium_if_absent(subscription)))
    }

    fn apply_transition(
        &self,
        order_id: &str,
        transition: SubscriptionTransition,
        now: DateTime<Utc>,
    ) -> Result<UserSubscription, TollgateError> {
        self.write(|t| t.apply_transition(order_id, transition, now))
    }

    fn increment_scan_usage(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UserSubscription, TollgateError> {
        self.write(|t| t.increment_scan_usage(user_id, now))
    }

    fn record_delivery(
        &self,
        detail: TransactionDetail,
        transition: Option<SubscriptionTransition>,
        now: DateTime<Utc>,
    ) -> Result<(TransactionDetail, Option<UserSubscription>), TollgateError> {
        self.write(|t| t.record_delivery(detail, transition, now))
    }

    fn transaction_detail(
        &self,
        order_id: &str,
    ) -> Result<Option<TransactionDetail>, TollgateError> {
        self.read(|t| t.transaction_details.get(order_id).cloned())
    }
}
