//! Purchase as a two-step workflow: charge, then commit or compensate.
//!
//! The gateway call and the local write cannot share a transaction. If
//! the charge succeeds and the local write fails, the workflow issues a
//! compensating refund before returning the original error.

use crate::client::http::PaymentGateway;
use crate::clock::Clock;
use crate::protocol::gateway::{
    ChargeRequest, ChargeResponse, CustomerDetails, ItemDetail, RefundRequest, TransactionDetails,
};
use crate::store::{
    EntitlementStore, PaymentStatus, SubscriptionPlan, User, UserSubscription,
};
use crate::TollgateError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Handle returned to the client after a successful purchase start.
#[derive(Debug, Clone)]
pub struct PurchaseReceipt {
    /// Merchant order id the webhook will reference.
    pub order_id: String,
    /// Gateway transaction token.
    pub transaction_token: String,
    /// Hosted payment page.
    pub redirect_url: String,
    /// The pending subscription row.
    pub subscription: UserSubscription,
}

/// A charge the gateway accepted but that is not yet recorded locally.
#[derive(Debug, Clone)]
pub struct PendingCharge {
    /// Merchant order id.
    pub order_id: String,
    /// Buyer.
    pub user_id: Uuid,
    /// Purchased plan.
    pub plan_id: Uuid,
    /// Payment method requested.
    pub payment_method: String,
    /// Gateway handle.
    pub response: ChargeResponse,
    /// When the charge was created.
    pub charged_at: DateTime<Utc>,
}

/// Terminal state of a workflow run, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseStage {
    /// Local row written.
    Committed,
    /// Local write failed and the refund went through.
    Compensated,
    /// Local write failed and the refund failed too.
    CompensationFailed,
}

/// Charge-then-commit purchase workflow.
pub struct PurchaseWorkflow<'a> {
    gateway: &'a dyn PaymentGateway,
    store: &'a dyn EntitlementStore,
    clock: &'a dyn Clock,
}

impl<'a> PurchaseWorkflow<'a> {
    /// Bind the workflow to its collaborators.
    pub fn new(
        gateway: &'a dyn PaymentGateway,
        store: &'a dyn EntitlementStore,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            gateway,
            store,
            clock,
        }
    }

    /// Step 1: ask the gateway for a transaction handle.
    pub fn charge(
        &self,
        user: &User,
        plan: &SubscriptionPlan,
        payment_method: &str,
    ) -> Result<PendingCharge, TollgateError> {
        let now = self.clock.now_utc();
        let order_id = new_order_id(now);

        let request = ChargeRequest {
            transaction_details: TransactionDetails {
                order_id: order_id.clone(),
                gross_amount: plan.price,
            },
            enabled_payments: vec![payment_method.to_string()],
            item_details: vec![ItemDetail {
                id: plan.id.to_string(),
                price: plan.price,
                quantity: 1,
                name: plan.name.clone(),
            }],
            customer_details: Some(CustomerDetails {
                email: user.email.clone(),
            }),
        };

        let response = self.gateway.create_transaction(&request).map_err(|e| {
            tracing::warn!(order_id = %order_id, error = %e, "gateway charge failed");
            e
        })?;

        Ok(PendingCharge {
            order_id,
            user_id: user.id,
            plan_id: plan.id,
            payment_method: payment_method.to_string(),
            response,
            charged_at: now,
        })
    }

    /// Step 2: record the pending subscription, or refund if that fails.
    ///
    /// The returned error is always the commit error; a refund failure is
    /// logged but never replaces it.
    pub fn commit_or_compensate(
        &self,
        pending: PendingCharge,
    ) -> (PurchaseStage, Result<PurchaseReceipt, TollgateError>) {
        let subscription = UserSubscription {
            id: Uuid::new_v4(),
            user_id: pending.user_id,
            plan_id: pending.plan_id,
            start_date: None,
            end_date: None,
            is_active: false,
            payment_method: pending.payment_method.clone(),
            order_id: Some(pending.order_id.clone()),
            transaction_id: Some(pending.response.token.clone()),
            payment_status: PaymentStatus::Pending,
            scans_used: 0,
            created_at: pending.charged_at,
            updated_at: pending.charged_at,
        };

        match self
            .store
            .insert_superseding(subscription, self.clock.now_utc())
        {
            Ok(subscription) => {
                tracing::info!(
                    order_id = %pending.order_id,
                    user_id = %pending.user_id,
                    plan_id = %pending.plan_id,
                    "purchase recorded, awaiting payment"
                );
                (
                    PurchaseStage::Committed,
                    Ok(PurchaseReceipt {
                        order_id: pending.order_id,
                        transaction_token: pending.response.token,
                        redirect_url: pending.response.redirect_url,
                        subscription,
                    }),
                )
            }
            Err(commit_error) => {
                let stage = self.compensate(&pending, &commit_error);
                (stage, Err(commit_error))
            }
        }
    }

    /// Run both steps.
    pub fn run(
        &self,
        user: &User,
        plan: &SubscriptionPlan,
        payment_method: &str,
    ) -> Result<PurchaseReceipt, TollgateError> {
        let pending = self.charge(user, plan, payment_method)?;
        self.commit_or_compensate(pending).1
    }

    fn compensate(&self, pending: &PendingCharge, cause: &TollgateError) -> PurchaseStage {
        let request = RefundRequest {
            refund_key: format!("{}-rollback", pending.order_id),
            reason: format!("local commit failed: {}", cause),
        };

        match self.gateway.refund(&pending.order_id, &request) {
            Ok(()) => {
                tracing::info!(order_id = %pending.order_id, "compensating refund issued");
                PurchaseStage::Compensated
            }
            Err(refund_error) => {
                tracing::error!(
                    order_id = %pending.order_id,
                    error = %refund_error,
                    cause = %cause,
                    "compensating refund failed; manual reconciliation required"
                );
                PurchaseStage::CompensationFailed
            }
        }
    }
}

/// Merchant order id: `SUB-<unix seconds>-<uuid simple>` (47 chars).
pub fn new_order_id(now: DateTime<Utc>) -> String {
    format!("SUB-{}-{}", now.timestamp(), Uuid::new_v4().simple())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::protocol::gateway::TransactionStatus;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    /// Scriptable in-process gateway.
    #[derive(Default)]
    pub(crate) struct FakeGateway {
        pub charges: Mutex<Vec<ChargeRequest>>,
        pub refunds: Mutex<Vec<String>>,
        pub statuses: Mutex<std::collections::HashMap<String, String>>,
        pub fail_charge: bool,
        pub fail_refund: bool,
    }

    impl FakeGateway {
        pub fn set_status(&self, order_id: &str, body: serde_json::Value) {
            self.statuses
                .lock()
                .unwrap()
                .insert(order_id.to_string(), body.to_string());
        }
    }

    impl PaymentGateway for FakeGateway {
        fn create_transaction(
            &self,
            request: &ChargeRequest,
        ) -> Result<ChargeResponse, TollgateError> {
            if self.fail_charge {
                return Err(TollgateError::GatewayError("charge declined".to_string()));
            }
            self.charges.lock().unwrap().push(request.clone());
            Ok(ChargeResponse {
                token: "T1".to_string(),
                redirect_url: format!(
                    "https://pay.example/{}",
                    request.transaction_details.order_id
                ),
            })
        }

        fn transaction_status(&self, order_id: &str) -> Result<TransactionStatus, TollgateError> {
            let body = self
                .statuses
                .lock()
                .unwrap()
                .get(order_id)
                .cloned()
                .ok_or_else(|| TollgateError::GatewayTransport("unreachable".to_string()))?;
            TransactionStatus::from_json(body.as_bytes())
        }

        fn refund(&self, order_id: &str, _request: &RefundRequest) -> Result<(), TollgateError> {
            if self.fail_refund {
                return Err(TollgateError::GatewayError("refund rejected".to_string()));
            }
            self.refunds.lock().unwrap().push(order_id.to_string());
            Ok(())
        }
    }

    /// Store whose subscription writes always fail.
    struct BrokenStore(MemoryStore);

    impl EntitlementStore for BrokenStore {
        fn get_user(&self, id: Uuid) -> Result<Option<User>, TollgateError> {
            self.0.get_user(id)
        }
        fn put_user(&self, user: User) -> Result<(), TollgateError> {
            self.0.put_user(user)
        }
        fn insert_token(&self, t: crate::store::ProductToken) -> Result<(), TollgateError> {
            self.0.insert_token(t)
        }
        fn token_for_user(
            &self,
            id: Uuid,
        ) -> Result<Option<crate::store::ProductToken>, TollgateError> {
            self.0.token_for_user(id)
        }
        fn token_by_code(
            &self,
            code: &str,
        ) -> Result<Option<crate::store::ProductToken>, TollgateError> {
            self.0.token_by_code(code)
        }
        fn redeem_token(
            &self,
            id: Uuid,
            code: &str,
            now: DateTime<Utc>,
            validity: chrono::Duration,
        ) -> Result<crate::store::ProductToken, TollgateError> {
            self.0.redeem_token(id, code, now, validity)
        }
        fn delete_token_if_expired(
            &self,
            id: Uuid,
            now: DateTime<Utc>,
            validity: chrono::Duration,
        ) -> Result<bool, TollgateError> {
            self.0.delete_token_if_expired(id, now, validity)
        }
        fn put_plan(&self, plan: SubscriptionPlan) -> Result<(), TollgateError> {
            self.0.put_plan(plan)
        }
        fn get_plan(&self, id: Uuid) -> Result<Option<SubscriptionPlan>, TollgateError> {
            self.0.get_plan(id)
        }
        fn plan_by_name(&self, name: &str) -> Result<Option<SubscriptionPlan>, TollgateError> {
            self.0.plan_by_name(name)
        }
        fn list_plans(&self) -> Result<Vec<SubscriptionPlan>, TollgateError> {
            self.0.list_plans()
        }
        fn subscriptions_for_user(
            &self,
            id: Uuid,
        ) -> Result<Vec<UserSubscription>, TollgateError> {
            self.0.subscriptions_for_user(id)
        }
        fn subscription_by_order(
            &self,
            order_id: &str,
        ) -> Result<Option<UserSubscription>, TollgateError> {
            self.0.subscription_by_order(order_id)
        }
        fn insert_superseding(
            &self,
            _subscription: UserSubscription,
            _now: DateTime<Utc>,
        ) -> Result<UserSubscription, TollgateError> {
            Err(TollgateError::StoreError("database unreachable".to_string()))
        }
        fn insert_freemium_if_absent(
            &self,
            s: UserSubscription,
        ) -> Result<Option<UserSubscription>, TollgateError> {
            self.0.insert_freemium_if_absent(s)
        }
        fn apply_transition(
            &self,
            order_id: &str,
            t: crate::store::SubscriptionTransition,
            now: DateTime<Utc>,
        ) -> Result<UserSubscription, TollgateError> {
            self.0.apply_transition(order_id, t, now)
        }
        fn increment_scan_usage(
            &self,
            id: Uuid,
            now: DateTime<Utc>,
        ) -> Result<UserSubscription, TollgateError> {
            self.0.increment_scan_usage(id, now)
        }
        fn record_delivery(
            &self,
            d: crate::store::TransactionDetail,
            t: Option<crate::store::SubscriptionTransition>,
            now: DateTime<Utc>,
        ) -> Result<
            (crate::store::TransactionDetail, Option<UserSubscription>),
            TollgateError,
        > {
            self.0.record_delivery(d, t, now)
        }
        fn transaction_detail(
            &self,
            order_id: &str,
        ) -> Result<Option<crate::store::TransactionDetail>, TollgateError> {
            self.0.transaction_detail(order_id)
        }
    }

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "buyer@example.com".to_string(),
            email_verified: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_run_records_pending_subscription() {
        let gateway = FakeGateway::default();
        let store = MemoryStore::new();
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let plan = SubscriptionPlan::new("Pro", 30000, 30);
        let buyer = user();

        let receipt = PurchaseWorkflow::new(&gateway, &store, &clock)
            .run(&buyer, &plan, "gopay")
            .unwrap();

        assert_eq!(receipt.transaction_token, "T1");
        assert!(receipt.order_id.starts_with("SUB-"));
        assert_eq!(receipt.subscription.payment_status, PaymentStatus::Pending);
        assert!(!receipt.subscription.is_active);
        assert_eq!(receipt.subscription.transaction_id.as_deref(), Some("T1"));

        let charges = gateway.charges.lock().unwrap();
        assert_eq!(charges[0].transaction_details.gross_amount, 30000);
        assert_eq!(charges[0].enabled_payments, vec!["gopay"]);
    }

    #[test]
    fn test_charge_failure_writes_nothing() {
        let gateway = FakeGateway {
            fail_charge: true,
            ..Default::default()
        };
        let store = MemoryStore::new();
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let buyer = user();

        let result = PurchaseWorkflow::new(&gateway, &store, &clock).run(
            &buyer,
            &SubscriptionPlan::new("Pro", 30000, 30),
            "gopay",
        );
        assert!(matches!(result, Err(TollgateError::GatewayError(_))));
        assert!(store.subscriptions_for_user(buyer.id).unwrap().is_empty());
    }

    #[test]
    fn test_commit_failure_compensates() {
        let gateway = FakeGateway::default();
        let store = BrokenStore(MemoryStore::new());
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let workflow = PurchaseWorkflow::new(&gateway, &store, &clock);

        let pending = workflow
            .charge(&user(), &SubscriptionPlan::new("Pro", 30000, 30), "gopay")
            .unwrap();
        let order_id = pending.order_id.clone();
        let (stage, result) = workflow.commit_or_compensate(pending);

        assert_eq!(stage, PurchaseStage::Compensated);
        assert!(matches!(result, Err(TollgateError::StoreError(_))));
        assert_eq!(*gateway.refunds.lock().unwrap(), vec![order_id]);
    }

    #[test]
    fn test_refund_failure_keeps_original_error() {
        let gateway = FakeGateway {
            fail_refund: true,
            ..Default::default()
        };
        let store = BrokenStore(MemoryStore::new());
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let workflow = PurchaseWorkflow::new(&gateway, &store, &clock);

        let pending = workflow
            .charge(&user(), &SubscriptionPlan::new("Pro", 30000, 30), "gopay")
            .unwrap();
        let (stage, result) = workflow.commit_or_compensate(pending);

        assert_eq!(stage, PurchaseStage::CompensationFailed);
        assert!(matches!(result, Err(TollgateError::StoreError(_))));
    }

    #[test]
    fn test_order_id_fits_gateway_limit() {
        let now = Utc::now();
        let id = new_order_id(now);
        assert!(id.len() <= 50);
        assert_ne!(id, new_order_id(now));
    }
}
