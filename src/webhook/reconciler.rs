//! Payment notification reconciliation.
//!
//! Pipeline per delivery:
//! 1. Parse the body (keeping `order_id` for logs even if parsing fails)
//! 2. Verify the signature; nothing is written on failure
//! 3. Query the gateway for the authoritative status
//! 4. Resolve the order's subscription and plan into a transition
//! 5. Record the detail and apply the transition in one store write
//!
//! Steps 1-4 write nothing. A failure in 5 keeps neither change and is
//! returned so the caller retries; the step is idempotent.
//!
//! Deliveries can arrive late or repeat. A settlement only activates a row
//! that never ran, and never switches off a newer purchase.
//!
//! The webhook body is never trusted for the final status.

use crate::client::http::PaymentGateway;
use crate::clock::Clock;
use crate::crypto::signature::{verify_signature, CanonicalForm};
use crate::protocol::gateway::{GatewayStatus, StatusEffect, TransactionStatus};
use crate::protocol::notification::parse_notification;
use crate::store::{EntitlementStore, SubscriptionTransition, TransactionDetail, UserSubscription};
use crate::TollgateError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// What a successfully reconciled delivery did.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Merchant order id.
    pub order_id: String,
    /// Status reported by the gateway query.
    pub gateway_status: GatewayStatus,
    /// Amount form the signature matched.
    pub matched_form: CanonicalForm,
    /// Detail row after the delivery was recorded.
    pub detail: TransactionDetail,
    /// Subscription after the transition; `None` for an unknown order.
    pub subscription: Option<UserSubscription>,
}

/// Verifies and applies gateway notifications.
pub struct PaymentReconciler {
    store: Arc<dyn EntitlementStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    server_key: String,
    accepted_forms: Vec<CanonicalForm>,
}

impl PaymentReconciler {
    /// Create a reconciler.
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        server_key: impl Into<String>,
        accepted_forms: Vec<CanonicalForm>,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            server_key: server_key.into(),
            accepted_forms,
        }
    }

    /// Handle one raw webhook body.
    ///
    /// # Errors
    /// * `ProtocolError` - Body is not a notification
    /// * `InvalidSignature` - No accepted form matches; nothing written
    /// * `GatewayError` / `GatewayTransport` - Status query failed; nothing written
    /// * `NotFound` - The order's plan is gone; nothing written
    /// * `StoreError` - Persisting failed; nothing kept, retry the delivery
    pub fn handle(&self, body: &[u8]) -> Result<ReconcileOutcome, TollgateError> {
        let parsed = parse_notification(body);
        let notification = match parsed.payload {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(order_id = ?parsed.order_id, error = %e, "unparseable payment notification");
                return Err(e);
            }
        };
        let order_id = notification.order_id.clone();

        let matched_form = match verify_signature(
            notification.signed_fields(),
            &notification.signature_key,
            &self.server_key,
            &self.accepted_forms,
        ) {
            Ok(form) => form,
            Err(e) => {
                tracing::warn!(order_id = %order_id, "payment notification signature rejected");
                return Err(e);
            }
        };

        let status = self.query_status(&order_id)?;
        let gateway_status = status.gateway_status();

        let subscription = self.store.subscription_by_order(&order_id)?;
        let now = self.clock.now_utc();
        let transition = match &subscription {
            Some(subscription) => Some(self.transition_for(&status, subscription, now)?),
            None => None,
        };

        let (detail, updated) = self.store.record_delivery(
            TransactionDetail {
                id: Uuid::new_v4(),
                order_id: order_id.clone(),
                subscription_id: subscription.as_ref().map(|s| s.id),
                transaction_id: status
                    .transaction_id
                    .clone()
                    .or_else(|| notification.transaction_id.clone()),
                transaction_status: gateway_status.to_string(),
                status_code: status.status_code.clone(),
                fraud_status: status.fraud_status.clone(),
                payment_type: status
                    .payment_type
                    .clone()
                    .or_else(|| notification.payment_type.clone()),
                gross_amount: status.gross_amount.clone(),
                settlement_time: status.settlement_time.clone(),
                raw: status.raw.clone(),
                delivery_count: 1,
                received_at: now,
                updated_at: now,
            },
            transition,
            now,
        )?;

        match &updated {
            Some(updated) => tracing::info!(
                order_id = %order_id,
                user_id = %updated.user_id,
                status = %gateway_status,
                payment_status = updated.payment_status.as_str(),
                is_active = updated.is_active,
                "payment notification reconciled"
            ),
            None => tracing::warn!(
                order_id = %order_id,
                status = %gateway_status,
                "payment notification for unknown order recorded"
            ),
        }

        Ok(ReconcileOutcome {
            order_id,
            gateway_status,
            matched_form,
            detail,
            subscription: updated,
        })
    }

    fn transition_for(
        &self,
        status: &TransactionStatus,
        subscription: &UserSubscription,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionTransition, TollgateError> {
        Ok(match status.effect() {
            StatusEffect::Activate => {
                let plan = self
                    .store
                    .get_plan(subscription.plan_id)?
                    .ok_or(TollgateError::NotFound {
                        entity: "Subscription plan",
                    })?;
                SubscriptionTransition::Activate {
                    start: now,
                    end: now + plan.validity(),
                }
            }
            StatusEffect::Deactivate => SubscriptionTransition::Deactivate,
            StatusEffect::NoChange => SubscriptionTransition::Unchanged,
        })
    }

    fn query_status(&self, order_id: &str) -> Result<TransactionStatus, TollgateError> {
        let status = self.gateway.transaction_status(order_id).map_err(|e| {
            tracing::warn!(order_id = %order_id, error = %e, "gateway status query failed");
            e
        })?;

        if !status.is_success() {
            tracing::warn!(
                order_id = %order_id,
                status_code = %status.status_code,
                "gateway status query returned non-success"
            );
            return Err(TollgateError::GatewayError(format!(
                "status query for {} returned {}: {}",
                order_id,
                status.status_code,
                status.status_message.clone().unwrap_or_default()
            )));
        }

        if let Some(reported) = status.order_id.as_deref() {
            if reported != order_id {
                return Err(TollgateError::ProtocolError(format!(
                    "status query for {} answered for {}",
                    order_id, reported
                )));
            }
        }

        Ok(status)
    }
}
