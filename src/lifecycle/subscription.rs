//! Subscription lifecycle: freemium grant, purchase, active lookup, scans.
//!
//! Expiry is observational. `get_active` skips a row whose end date has
//! passed but never flips its `is_active` flag; no reaper runs.

use crate::client::http::PaymentGateway;
use crate::clock::Clock;
use crate::lifecycle::purchase::{PurchaseReceipt, PurchaseWorkflow};
use crate::policy::access::ScanCaps;
use crate::store::{
    EntitlementStore, PaymentStatus, SubscriptionPlan, UserSubscription, FREEMIUM_PAYMENT_METHOD,
};
use crate::TollgateError;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of [`SubscriptionManager::grant_freemium_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreemiumGrant {
    /// The trial row was created.
    Granted(UserSubscription),
    /// The user already had a subscription row; nothing changed.
    AlreadyGranted,
}

/// Creates, supersedes and looks up subscriptions.
pub struct SubscriptionManager {
    store: Arc<dyn EntitlementStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    freemium_plan_name: String,
    freemium_duration_days: u32,
}

impl SubscriptionManager {
    /// Create a manager.
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        freemium_plan_name: impl Into<String>,
        freemium_duration_days: u32,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            freemium_plan_name: freemium_plan_name.into(),
            freemium_duration_days,
        }
    }

    /// Reserved trial plan name.
    pub fn freemium_plan_name(&self) -> &str {
        &self.freemium_plan_name
    }

    /// The user's entitled subscription: `is_active` and `now < end_date`.
    pub fn get_active(&self, user_id: Uuid) -> Result<Option<UserSubscription>, TollgateError> {
        let now = self.clock.now_utc();
        Ok(self
            .store
            .subscriptions_for_user(user_id)?
            .into_iter()
            .find(|s| s.is_entitled_at(now)))
    }

    /// The entitled subscription together with its plan.
    pub fn get_active_with_plan(
        &self,
        user_id: Uuid,
    ) -> Result<Option<(UserSubscription, SubscriptionPlan)>, TollgateError> {
        let Some(subscription) = self.get_active(user_id)? else {
            return Ok(None);
        };
        let plan = self
            .store
            .get_plan(subscription.plan_id)?
            .ok_or(TollgateError::NotFound {
                entity: "Subscription plan",
            })?;
        Ok(Some((subscription, plan)))
    }

    /// Every subscription row of the user, newest first.
    pub fn history(&self, user_id: Uuid) -> Result<Vec<UserSubscription>, TollgateError> {
        self.store.subscriptions_for_user(user_id)
    }

    /// Grant the trial exactly once per user.
    ///
    /// A no-op if the user has any subscription row, active or not.
    /// Concurrent calls are settled inside the store.
    pub fn grant_freemium_once(&self, user_id: Uuid) -> Result<FreemiumGrant, TollgateError> {
        let plan = self
            .store
            .plan_by_name(&self.freemium_plan_name)?
            .ok_or(TollgateError::NotFound {
                entity: "Freemium plan",
            })?;

        if !self.store.subscriptions_for_user(user_id)?.is_empty() {
            tracing::debug!(user_id = %user_id, "freemium already granted or superseded");
            return Ok(FreemiumGrant::AlreadyGranted);
        }

        let now = self.clock.now_utc();
        let end = now + chrono::Duration::days(i64::from(self.freemium_duration_days));
        let subscription = UserSubscription {
            id: Uuid::new_v4(),
            user_id,
            plan_id: plan.id,
            start_date: Some(now),
            end_date: Some(end),
            is_active: true,
            payment_method: FREEMIUM_PAYMENT_METHOD.to_string(),
            order_id: None,
            transaction_id: None,
            payment_status: PaymentStatus::Completed,
            scans_used: 0,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_freemium_if_absent(subscription)? {
            Some(granted) => {
                tracing::info!(user_id = %user_id, end_date = %end, "freemium trial granted");
                Ok(FreemiumGrant::Granted(granted))
            }
            None => {
                tracing::debug!(user_id = %user_id, "freemium grant lost race, already present");
                Ok(FreemiumGrant::AlreadyGranted)
            }
        }
    }

    /// Active plans, cheapest first.
    pub fn list_plans(&self) -> Result<Vec<SubscriptionPlan>, TollgateError> {
        let mut plans: Vec<SubscriptionPlan> = self
            .store
            .list_plans()?
            .into_iter()
            .filter(|p| p.is_active)
            .collect();
        plans.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.name.cmp(&b.name)));
        Ok(plans)
    }

    /// Start a paid purchase.
    ///
    /// Charges the gateway, then supersedes any active subscription with a
    /// pending row. If the local write fails the charge is refunded.
    pub fn purchase(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        payment_method: &str,
    ) -> Result<PurchaseReceipt, TollgateError> {
        let payment_method = payment_method.trim();
        if payment_method.is_empty() {
            return Err(TollgateError::ProtocolError(
                "payment_method is required".to_string(),
            ));
        }

        let user = self
            .store
            .get_user(user_id)?
            .ok_or(TollgateError::NotFound { entity: "User" })?;
        let plan = self
            .store
            .get_plan(plan_id)?
            .filter(|p| p.is_active)
            .ok_or(TollgateError::NotFound {
                entity: "Subscription plan",
            })?;
        if plan.name == self.freemium_plan_name {
            return Err(TollgateError::Conflict(
                "the freemium plan cannot be purchased".to_string(),
            ));
        }

        PurchaseWorkflow::new(
            self.gateway.as_ref(),
            self.store.as_ref(),
            self.clock.as_ref(),
        )
        .run(&user, &plan, payment_method)
    }

    /// Scan quota on the user's entitled subscription.
    pub fn scan_caps(&self, user_id: Uuid) -> Result<Option<ScanCaps>, TollgateError> {
        Ok(self
            .get_active_with_plan(user_id)?
            .map(|(sub, plan)| ScanCaps::from_subscription(&sub, &plan)))
    }

    /// Count one scan against the entitled subscription's quota.
    ///
    /// # Errors
    /// * `NotFound` - No entitled subscription
    /// * `ScanQuotaExceeded` - Quota used up
    pub fn consume_scan(&self, user_id: Uuid) -> Result<ScanCaps, TollgateError> {
        let now = self.clock.now_utc();
        let subscription = self.store.increment_scan_usage(user_id, now)?;
        let plan = self
            .store
            .get_plan(subscription.plan_id)?
            .ok_or(TollgateError::NotFound {
                entity: "Subscription plan",
            })?;
        Ok(ScanCaps::from_subscription(&subscription, &plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::lifecycle::purchase::tests::FakeGateway;
    use crate::store::{MemoryStore, User};
    use chrono::Utc;

    struct Fixture {
        manager: Arc<SubscriptionManager>,
        store: Arc<MemoryStore>,
        clock: MockClock,
        freemium: SubscriptionPlan,
        pro: SubscriptionPlan,
        user: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let freemium = SubscriptionPlan::new("Freemium Trial", 0, 14).with_feature("scan_ai", true);
        let pro = SubscriptionPlan::new("Pro", 30000, 30)
            .with_feature("scan_ai", true)
            .with_scan_quota(2);
        store.put_plan(freemium.clone()).unwrap();
        store.put_plan(pro.clone()).unwrap();

        let user = Uuid::new_v4();
        store
            .put_user(User {
                id: user,
                email: "a@example.com".to_string(),
                email_verified: true,
                created_at: Utc::now(),
            })
            .unwrap();

        let manager = Arc::new(SubscriptionManager::new(
            store.clone(),
            Arc::new(FakeGateway::default()),
            Arc::new(clock.clone()),
            "Freemium Trial",
            14,
        ));

        Fixture {
            manager,
            store,
            clock,
            freemium,
            pro,
            user,
        }
    }

    #[test]
    fn test_grant_freemium_creates_trial() {
        let f = fixture();
        let FreemiumGrant::Granted(sub) = f.manager.grant_freemium_once(f.user).unwrap() else {
            panic!("expected a grant");
        };

        assert_eq!(sub.plan_id, f.freemium.id);
        assert_eq!(sub.payment_method, "freemium_trial");
        assert_eq!(sub.payment_status, PaymentStatus::Completed);
        assert!(sub.is_active);
        assert_eq!(sub.end_date, Some(f.clock.now_utc() + chrono::Duration::days(14)));
    }

    #[test]
    fn test_grant_freemium_twice_is_noop() {
        let f = fixture();
        f.manager.grant_freemium_once(f.user).unwrap();
        assert_eq!(
            f.manager.grant_freemium_once(f.user).unwrap(),
            FreemiumGrant::AlreadyGranted
        );
        assert_eq!(f.store.subscriptions_for_user(f.user).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_grant_freemium_concurrently_creates_one_row() {
        let f = fixture();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&f.manager);
                let user = f.user;
                tokio::task::spawn_blocking(move || manager.grant_freemium_once(user).unwrap())
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), FreemiumGrant::Granted(_)) {
                granted += 1;
            }
        }

        assert_eq!(granted, 1);
        assert_eq!(f.store.subscriptions_for_user(f.user).unwrap().len(), 1);
    }

    #[test]
    fn test_grant_freemium_requires_plan() {
        let store = Arc::new(MemoryStore::new());
        let manager = SubscriptionManager::new(
            store,
            Arc::new(FakeGateway::default()),
            Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z")),
            "Freemium Trial",
            14,
        );
        assert!(matches!(
            manager.grant_freemium_once(Uuid::new_v4()),
            Err(TollgateError::NotFound { .. })
        ));
    }

    #[test]
    fn test_get_active_is_observational_after_expiry() {
        let f = fixture();
        f.manager.grant_freemium_once(f.user).unwrap();
        assert!(f.manager.get_active(f.user).unwrap().is_some());

        f.clock.advance(chrono::Duration::days(15));
        assert!(f.manager.get_active(f.user).unwrap().is_none());

        // The stored flag is left alone.
        let rows = f.store.subscriptions_for_user(f.user).unwrap();
        assert!(rows[0].is_active);
    }

    #[test]
    fn test_purchase_supersedes_trial() {
        let f = fixture();
        f.manager.grant_freemium_once(f.user).unwrap();

        let receipt = f.manager.purchase(f.user, f.pro.id, "gopay").unwrap();
        assert_eq!(receipt.subscription.plan_id, f.pro.id);

        let rows = f.store.subscriptions_for_user(f.user).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|s| !s.is_active));
    }

    #[test]
    fn test_purchase_validates_inputs() {
        let f = fixture();
        assert!(matches!(
            f.manager.purchase(f.user, f.pro.id, " "),
            Err(TollgateError::ProtocolError(_))
        ));
        assert!(matches!(
            f.manager.purchase(f.user, Uuid::new_v4(), "gopay"),
            Err(TollgateError::NotFound { .. })
        ));
        assert!(matches!(
            f.manager.purchase(Uuid::new_v4(), f.pro.id, "gopay"),
            Err(TollgateError::NotFound { entity: "User" })
        ));
        assert!(matches!(
            f.manager.purchase(f.user, f.freemium.id, "gopay"),
            Err(TollgateError::Conflict(_))
        ));
    }

    #[test]
    fn test_purchase_rejects_inactive_plan() {
        let f = fixture();
        let mut retired = SubscriptionPlan::new("Legacy", 10000, 30);
        retired.is_active = false;
        f.store.put_plan(retired.clone()).unwrap();

        assert!(matches!(
            f.manager.purchase(f.user, retired.id, "gopay"),
            Err(TollgateError::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_plans_sorted_by_price() {
        let f = fixture();
        let plans = f.manager.list_plans().unwrap();
        let names: Vec<&str> = plans.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Freemium Trial", "Pro"]);
    }

    #[test]
    fn test_consume_scan_tracks_quota() {
        let f = fixture();
        let mut paid = UserSubscription {
            id: Uuid::new_v4(),
            user_id: f.user,
            plan_id: f.pro.id,
            start_date: Some(f.clock.now_utc()),
            end_date: Some(f.clock.now_utc() + chrono::Duration::days(30)),
            is_active: true,
            payment_method: "gopay".to_string(),
            order_id: Some("SUB-1".to_string()),
            transaction_id: Some("T1".to_string()),
            payment_status: PaymentStatus::Completed,
            scans_used: 0,
            created_at: f.clock.now_utc(),
            updated_at: f.clock.now_utc(),
        };
        paid = f.store.insert_superseding(paid, f.clock.now_utc()).unwrap();

        let caps = f.manager.consume_scan(f.user).unwrap();
        assert_eq!(caps.remaining(), Some(1));
        f.manager.consume_scan(f.user).unwrap();
        assert!(matches!(
            f.manager.consume_scan(f.user),
            Err(TollgateError::ScanQuotaExceeded)
        ));
        assert_eq!(f.manager.scan_caps(f.user).unwrap().unwrap().used, 2);
        assert_eq!(paid.scans_used, 0);
    }
}
