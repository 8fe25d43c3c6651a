//! Per-request entitlement resolution.
//!
//! Evaluation order, first match wins:
//! 1. an entitled subscription (freemium or paid)
//! 2. a product token that is still valid
//! 3. nothing
//!
//! The only side effect is lazy deletion of an expired product token.

use crate::lifecycle::{SubscriptionManager, TokenManager};
use crate::policy::access::{Access, DenyCode};
use crate::TollgateError;
use std::sync::Arc;
use uuid::Uuid;

/// Merges token and subscription state into one [`Access`].
pub struct EntitlementResolver {
    subscriptions: Arc<SubscriptionManager>,
    tokens: Arc<TokenManager>,
}

impl EntitlementResolver {
    /// Create a resolver over the two lifecycle managers.
    pub fn new(subscriptions: Arc<SubscriptionManager>, tokens: Arc<TokenManager>) -> Self {
        Self {
            subscriptions,
            tokens,
        }
    }

    /// Resolve the user's access now.
    ///
    /// Only infrastructure failures are errors; no entitlement is
    /// `Access { granted: false, .. }`.
    pub fn resolve(&self, user_id: Uuid) -> Result<Access, TollgateError> {
        if let Some((subscription, plan)) = self.subscriptions.get_active_with_plan(user_id)? {
            return Ok(Access::from_subscription(
                &subscription,
                &plan,
                self.subscriptions.freemium_plan_name(),
            ));
        }

        if let Some((_, expires_at)) = self.tokens.current(user_id)? {
            return Ok(Access::from_product_token(expires_at));
        }

        Ok(Access::denied())
    }

    /// Re-resolve and test one feature flag. Absent keys are `false`.
    pub fn has_feature(&self, user_id: Uuid, feature: &str) -> Result<bool, TollgateError> {
        Ok(self.resolve(user_id)?.has_feature(feature))
    }

    /// Why a user without access is refused, from their subscription history.
    pub fn deny_code(&self, user_id: Uuid) -> Result<DenyCode, TollgateError> {
        let history = self.subscriptions.history(user_id)?;
        let code = match history.first() {
            Some(latest) if latest.is_freemium() => DenyCode::FreemiumExpired,
            Some(_) => DenyCode::SubscriptionRequired,
            None => DenyCode::AccessRequired,
        };
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::lifecycle::purchase::tests::FakeGateway;
    use crate::policy::access::AccessType;
    use crate::store::{
        EntitlementStore, MemoryStore, PaymentStatus, SubscriptionPlan, SubscriptionTransition,
        User, UserSubscription,
    };
    use chrono::Duration;

    struct Fixture {
        resolver: EntitlementResolver,
        subscriptions: Arc<SubscriptionManager>,
        tokens: Arc<TokenManager>,
        store: Arc<MemoryStore>,
        clock: MockClock,
        pro: SubscriptionPlan,
        user: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let freemium = SubscriptionPlan::new("Freemium Trial", 0, 14).with_feature("scan_ai", true);
        let pro = SubscriptionPlan::new("Pro", 30000, 30)
            .with_feature("scan_ai", true)
            .with_feature("export", true);
        store.put_plan(freemium).unwrap();
        store.put_plan(pro.clone()).unwrap();

        let user = Uuid::new_v4();
        store
            .put_user(User {
                id: user,
                email: "a@example.com".to_string(),
                email_verified: true,
                created_at: clock.now_utc(),
            })
            .unwrap();

        let subscriptions = Arc::new(SubscriptionManager::new(
            store.clone(),
            Arc::new(FakeGateway::default()),
            Arc::new(clock.clone()),
            "Freemium Trial",
            14,
        ));
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::days(30),
        ));
        let resolver = EntitlementResolver::new(subscriptions.clone(), tokens.clone());

        Fixture {
            resolver,
            subscriptions,
            tokens,
            store,
            clock,
            pro,
            user,
        }
    }

    fn activate_paid(f: &Fixture) {
        let receipt = f.subscriptions.purchase(f.user, f.pro.id, "gopay").unwrap();
        let now = f.clock.now_utc();
        f.store
            .apply_transition(
                &receipt.order_id,
                SubscriptionTransition::Activate {
                    start: now,
                    end: now + f.pro.validity(),
                },
                now,
            )
            .unwrap();
    }

    #[test]
    fn test_no_entitlement_is_denied_value() {
        let f = fixture();
        let access = f.resolver.resolve(f.user).unwrap();
        assert_eq!(access, Access::denied());
        assert_eq!(f.resolver.deny_code(f.user).unwrap(), DenyCode::AccessRequired);
    }

    #[test]
    fn test_freemium_then_expiry() {
        let f = fixture();
        f.subscriptions.grant_freemium_once(f.user).unwrap();

        let access = f.resolver.resolve(f.user).unwrap();
        assert!(access.granted);
        assert_eq!(access.access_type, AccessType::Freemium);
        assert!(f.resolver.has_feature(f.user, "scan_ai").unwrap());
        assert!(!f.resolver.has_feature(f.user, "unknown").unwrap());

        f.clock.advance(Duration::days(15));
        assert!(!f.resolver.resolve(f.user).unwrap().granted);
        assert_eq!(f.resolver.deny_code(f.user).unwrap(), DenyCode::FreemiumExpired);
    }

    #[test]
    fn test_granted_is_monotonic_across_end_date() {
        let f = fixture();
        f.subscriptions.grant_freemium_once(f.user).unwrap();
        let end = f.resolver.resolve(f.user).unwrap().expires_at.unwrap();

        let mut was_granted = true;
        for step in [-60, -1, 0, 1, 60, 3600] {
            f.clock.set(end + Duration::seconds(step));
            let granted = f.resolver.resolve(f.user).unwrap().granted;
            assert_eq!(granted, step < 0, "step {}", step);
            // Once false, never true again.
            assert!(was_granted || !granted);
            was_granted = granted;
        }
    }

    #[test]
    fn test_product_token_access() {
        let f = fixture();
        f.tokens.issue("ABC123").unwrap();
        f.tokens.redeem(f.user, "ABC123").unwrap();

        let access = f.resolver.resolve(f.user).unwrap();
        assert_eq!(access.access_type, AccessType::ProductToken);
        assert!(access.features.is_empty());
        assert!(!f.resolver.has_feature(f.user, "scan_ai").unwrap());

        f.clock.advance(Duration::days(31));
        assert!(!f.resolver.resolve(f.user).unwrap().granted);
        assert!(f.store.token_by_code("ABC123").unwrap().is_none());
    }

    #[test]
    fn test_subscription_wins_over_token() {
        let f = fixture();
        f.tokens.issue("ABC123").unwrap();
        f.tokens.redeem(f.user, "ABC123").unwrap();
        activate_paid(&f);

        let access = f.resolver.resolve(f.user).unwrap();
        assert_eq!(access.access_type, AccessType::Subscription);
        assert!(access.has_feature("export"));
    }

    #[test]
    fn test_lapsed_paid_subscription_requires_subscription() {
        let f = fixture();
        activate_paid(&f);
        f.clock.advance(Duration::days(31));

        assert!(!f.resolver.resolve(f.user).unwrap().granted);
        assert_eq!(
            f.resolver.deny_code(f.user).unwrap(),
            DenyCode::SubscriptionRequired
        );
    }

    #[test]
    fn test_pending_purchase_does_not_grant() {
        let f = fixture();
        f.subscriptions.purchase(f.user, f.pro.id, "gopay").unwrap();

        let rows = f.store.subscriptions_for_user(f.user).unwrap();
        assert_eq!(rows[0].payment_status, PaymentStatus::Pending);
        assert!(!f.resolver.resolve(f.user).unwrap().granted);
    }

    #[test]
    fn test_flagged_active_but_expired_row_is_not_entitled() {
        let f = fixture();
        let now = f.clock.now_utc();
        let stale = UserSubscription {
            id: Uuid::new_v4(),
            user_id: f.user,
            plan_id: f.pro.id,
            start_date: Some(now - Duration::days(40)),
            end_date: Some(now - Duration::days(10)),
            is_active: true,
            payment_method: "gopay".to_string(),
            order_id: Some("SUB-OLD".to_string()),
            transaction_id: None,
            payment_status: PaymentStatus::Completed,
            scans_used: 0,
            created_at: now - Duration::days(40),
            updated_at: now - Duration::days(40),
        };
        f.store.insert_superseding(stale, now).unwrap();

        assert!(!f.resolver.resolve(f.user).unwrap().granted);
    }
}
