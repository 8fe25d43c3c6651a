//! Tollgate - the main public API.
//!
//! `Tollgate` wires configuration, clock, store and gateway into the
//! lifecycle managers, the resolver, the reconciler and the access gate,
//! and exposes one method per inbound route. A routing layer only has to
//! extract the user id or `Authorization` header and serialize the result.

use crate::client::http::{PaymentGateway, SnapGatewayClient};
use crate::clock::{Clock, SystemClock};
use crate::config::TollgateConfig;
use crate::gate::{AccessGate, Admitted, JwtVerifier, Rejection};
use crate::lifecycle::{FreemiumGrant, SubscriptionManager, TokenManager};
use crate::policy::{Access, AccessType, EntitlementResolver, ScanCaps};
use crate::store::{EntitlementStore, SubscriptionPlan, UserSubscription};
use crate::webhook::{PaymentReconciler, ReconcileOutcome};
use crate::TollgateError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// `GET /subscriptions/me` response.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionView {
    /// Resolved access.
    pub access: Access,
    /// Entitled subscription, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<UserSubscription>,
    /// Its plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<SubscriptionPlan>,
    /// Whole days left, rounded up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<i64>,
}

/// `GET /subscriptions/check-feature` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureCheck {
    /// Feature asked about.
    pub feature: String,
    /// Whether it is on for the user.
    pub enabled: bool,
    /// Source of the user's access.
    pub access_type: AccessType,
}

/// `POST /product-token/verify` response.
#[derive(Debug, Clone, Serialize)]
pub struct TokenView {
    /// Redeemed code.
    pub code: String,
    /// When the token stops granting access.
    pub expires_at: Option<DateTime<Utc>>,
    /// Access after redemption.
    pub access: Access,
}

/// `POST /subscriptions/purchase/{plan_id}` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseView {
    /// Client SDK transaction token.
    pub transaction_token: String,
    /// Hosted payment page.
    pub redirect_url: String,
    /// Merchant order id.
    pub order_id: String,
}

/// Entitlement engine facade.
///
/// Create one instance per process and share it.
pub struct Tollgate {
    config: TollgateConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn EntitlementStore>,
    tokens: Arc<TokenManager>,
    subscriptions: Arc<SubscriptionManager>,
    resolver: Arc<EntitlementResolver>,
    reconciler: PaymentReconciler,
    gate: AccessGate,
}

impl Tollgate {
    /// Create an engine talking to the configured gateway.
    ///
    /// Uses the system clock for time operations.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Configuration validation fails
    /// - HTTP client creation fails
    pub fn new(
        config: TollgateConfig,
        store: Arc<dyn EntitlementStore>,
    ) -> Result<Self, TollgateError> {
        config.validate()?;
        let gateway = Arc::new(SnapGatewayClient::new(&config.gateway)?);
        Self::with_components(config, store, gateway, Arc::new(SystemClock))
    }

    /// Create an engine from explicit collaborators.
    pub fn with_components(
        config: TollgateConfig,
        store: Arc<dyn EntitlementStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TollgateError> {
        config.validate()?;

        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            clock.clone(),
            config.token_validity_chrono()?,
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            store.clone(),
            gateway.clone(),
            clock.clone(),
            config.freemium_plan_name.clone(),
            config.freemium_duration_days,
        ));
        let resolver = Arc::new(EntitlementResolver::new(
            subscriptions.clone(),
            tokens.clone(),
        ));
        let reconciler = PaymentReconciler::new(
            store.clone(),
            gateway,
            clock.clone(),
            config.gateway.server_key.clone(),
            config.accepted_signature_forms.clone(),
        );
        let gate = AccessGate::new(
            JwtVerifier::new(&config.jwt_secret, clock.clone()),
            store.clone(),
            resolver.clone(),
            config.upgrade_url.clone(),
        );

        Ok(Self {
            config,
            clock,
            store,
            tokens,
            subscriptions,
            resolver,
            reconciler,
            gate,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &TollgateConfig {
        &self.config
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }

    /// Product token lifecycle.
    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Subscription lifecycle.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Entitlement resolver.
    pub fn resolver(&self) -> &EntitlementResolver {
        &self.resolver
    }

    /// Access gate.
    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    /// Resolve a user's access now.
    pub fn resolve(&self, user_id: Uuid) -> Result<Access, TollgateError> {
        self.resolver.resolve(user_id)
    }

    /// Mark the user's email verified and grant the trial once.
    pub fn on_email_verified(&self, user_id: Uuid) -> Result<FreemiumGrant, TollgateError> {
        let mut user = self
            .store
            .get_user(user_id)?
            .ok_or(TollgateError::NotFound { entity: "User" })?;
        if !user.email_verified {
            user.email_verified = true;
            self.store.put_user(user)?;
        }
        self.subscriptions.grant_freemium_once(user_id)
    }

    /// `GET /subscriptions/me`
    pub fn subscription_me(&self, user_id: Uuid) -> Result<SubscriptionView, TollgateError> {
        let access = self.resolver.resolve(user_id)?;
        let active = self.subscriptions.get_active_with_plan(user_id)?;
        let now = self.clock.now_utc();

        let (subscription, plan) = match active {
            Some((s, p)) => (Some(s), Some(p)),
            None => (None, None),
        };
        let days_remaining = subscription
            .as_ref()
            .and_then(|s| s.end_date)
            .or(access.expires_at)
            .filter(|_| access.granted)
            .map(|end| days_until(now, end));

        Ok(SubscriptionView {
            access,
            subscription,
            plan,
            days_remaining,
        })
    }

    /// `GET /subscriptions/check-feature?feature=<name>`
    pub fn check_feature(&self, user_id: Uuid, feature: &str) -> Result<FeatureCheck, TollgateError> {
        let access = self.resolver.resolve(user_id)?;
        Ok(FeatureCheck {
            feature: feature.to_string(),
            enabled: access.has_feature(feature),
            access_type: access.access_type,
        })
    }

    /// `POST /product-token/verify?token=<code>`
    pub fn verify_product_token(&self, user_id: Uuid, code: &str) -> Result<TokenView, TollgateError> {
        let token = self.tokens.redeem(user_id, code)?;
        let access = self.resolver.resolve(user_id)?;
        Ok(TokenView {
            expires_at: token.expires_at(self.tokens.validity()),
            code: token.code,
            access,
        })
    }

    /// `GET /subscriptions/plans`
    pub fn list_plans(&self) -> Result<Vec<SubscriptionPlan>, TollgateError> {
        self.subscriptions.list_plans()
    }

    /// `POST /subscriptions/purchase/{plan_id}`
    pub fn purchase(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        payment_method: &str,
    ) -> Result<PurchaseView, TollgateError> {
        let receipt = self.subscriptions.purchase(user_id, plan_id, payment_method)?;
        Ok(PurchaseView {
            transaction_token: receipt.transaction_token,
            redirect_url: receipt.redirect_url,
            order_id: receipt.order_id,
        })
    }

    /// `POST /subscriptions/notification`
    pub fn handle_notification(&self, body: &[u8]) -> Result<ReconcileOutcome, TollgateError> {
        self.reconciler.handle(body)
    }

    /// Count one scan against the user's plan quota.
    pub fn consume_scan(&self, user_id: Uuid) -> Result<ScanCaps, TollgateError> {
        self.subscriptions.consume_scan(user_id)
    }

    /// Gate a route on any entitlement.
    pub fn require_access(&self, authorization: Option<&str>) -> Result<Admitted, Rejection> {
        self.gate.require_access(authorization)
    }

    /// Gate a route on a plan feature.
    pub fn require_feature(
        &self,
        authorization: Option<&str>,
        feature: &str,
    ) -> Result<Admitted, Rejection> {
        self.gate.require_feature(authorization, feature)
    }
}

fn days_until(now: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let seconds = (end - now).num_seconds().max(0);
    (seconds + 86_399) / 86_400
}
