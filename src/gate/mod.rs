//! Request-time access gate.
//!
//! Order per request, first failure wins:
//! 1. bearer token present and well-formed, else 401
//! 2. token verifies and the user exists, else 401
//! 3. entitlement resolves as granted, else 403 with a deny code
//! 4. the requested feature is on, else 403 `subscription_required`

pub mod jwt;
pub mod rejection;

pub use jwt::{bearer_token, Claims, JwtVerifier};
pub use rejection::{Rejection, RejectionBody};

use crate::policy::{Access, DenyCode, EntitlementResolver};
use crate::store::{EntitlementStore, User};
use crate::TollgateError;
use std::sync::Arc;

/// A request that passed the gate.
#[derive(Debug, Clone)]
pub struct Admitted {
    /// Authenticated user.
    pub user: User,
    /// Access resolved for this request.
    pub access: Access,
}

/// Authenticates a request and enforces entitlement.
pub struct AccessGate {
    jwt: JwtVerifier,
    store: Arc<dyn EntitlementStore>,
    resolver: Arc<EntitlementResolver>,
    upgrade_url: String,
}

impl AccessGate {
    /// Create a gate.
    pub fn new(
        jwt: JwtVerifier,
        store: Arc<dyn EntitlementStore>,
        resolver: Arc<EntitlementResolver>,
        upgrade_url: impl Into<String>,
    ) -> Self {
        Self {
            jwt,
            store,
            resolver,
            upgrade_url: upgrade_url.into(),
        }
    }

    /// Token signer/verifier.
    pub fn jwt(&self) -> &JwtVerifier {
        &self.jwt
    }

    /// Resolve the caller from an `Authorization` header value.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<User, Rejection> {
        self.authenticate_inner(authorization)
            .map_err(|e| self.reject(&e))
    }

    /// Admit any entitled user.
    pub fn require_access(&self, authorization: Option<&str>) -> Result<Admitted, Rejection> {
        let user = self.authenticate(authorization)?;
        let access = self.resolver.resolve(user.id).map_err(|e| self.reject(&e))?;

        if !access.granted {
            let code = self.resolver.deny_code(user.id).map_err(|e| self.reject(&e))?;
            tracing::debug!(user_id = %user.id, code = code.as_str(), "access denied");
            return Err(Rejection::forbidden(code, &self.upgrade_url));
        }
        Ok(Admitted { user, access })
    }

    /// Admit an entitled user whose plan has `feature` switched on.
    ///
    /// Product-token access carries no feature flags, so it never passes a
    /// feature gate.
    pub fn require_feature(
        &self,
        authorization: Option<&str>,
        feature: &str,
    ) -> Result<Admitted, Rejection> {
        let admitted = self.require_access(authorization)?;
        if !admitted.access.has_feature(feature) {
            tracing::debug!(user_id = %admitted.user.id, feature, "feature not in plan");
            return Err(Rejection::forbidden(
                DenyCode::SubscriptionRequired,
                &self.upgrade_url,
            ));
        }
        Ok(admitted)
    }

    /// Render an error the way this gate does.
    pub fn reject(&self, error: &TollgateError) -> Rejection {
        if error.is_infrastructure() {
            tracing::error!(error = %error, "access check failed");
        }
        Rejection::from_error(error, &self.upgrade_url)
    }

    fn authenticate_inner(&self, authorization: Option<&str>) -> Result<User, TollgateError> {
        let token = bearer_token(authorization)?;
        let claims = self.jwt.verify(token)?;
        self.store
            .get_user(claims.sub)?
            .ok_or_else(|| TollgateError::Unauthenticated("Unknown user".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::lifecycle::purchase::tests::FakeGateway;
    use crate::lifecycle::{SubscriptionManager, TokenManager};
    use crate::store::{MemoryStore, SubscriptionPlan};
    use chrono::Duration;
    use uuid::Uuid;

    struct Fixture {
        gate: AccessGate,
        subscriptions: Arc<SubscriptionManager>,
        tokens: Arc<TokenManager>,
        clock: MockClock,
        user: Uuid,
        header: String,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        store
            .put_plan(SubscriptionPlan::new("Freemium Trial", 0, 14).with_feature("scan_ai", true))
            .unwrap();

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
        let resolver = Arc::new(EntitlementResolver::new(
            subscriptions.clone(),
            tokens.clone(),
        ));
        let jwt = JwtVerifier::new("secret", Arc::new(clock.clone()));
        let header = format!("Bearer {}", jwt.issue(user, Duration::days(60)).unwrap());
        let gate = AccessGate::new(jwt, store, resolver, "/subscriptions/plans");

        Fixture {
            gate,
            subscriptions,
            tokens,
            clock,
            user,
            header,
        }
    }

    #[test]
    fn test_missing_header_is_401() {
        let f = fixture();
        assert_eq!(f.gate.require_access(None).unwrap_err().status, 401);
    }

    #[test]
    fn test_unknown_user_is_401() {
        let f = fixture();
        let token = f.gate.jwt().issue(Uuid::new_v4(), Duration::hours(1)).unwrap();
        let header = format!("Bearer {}", token);
        assert_eq!(f.gate.require_access(Some(&header)).unwrap_err().status, 401);
    }

    #[test]
    fn test_never_entitled_is_access_required() {
        let f = fixture();
        let r = f.gate.require_access(Some(&f.header)).unwrap_err();
        assert_eq!(r.status, 403);
        assert_eq!(r.body.code, "access_required");
        assert_eq!(r.body.upgrade_url.as_deref(), Some("/subscriptions/plans"));
    }

    #[test]
    fn test_freemium_admits_then_expires() {
        let f = fixture();
        f.subscriptions.grant_freemium_once(f.user).unwrap();

        let admitted = f.gate.require_feature(Some(&f.header), "scan_ai").unwrap();
        assert_eq!(admitted.user.id, f.user);

        f.clock.advance(Duration::days(15));
        let r = f.gate.require_access(Some(&f.header)).unwrap_err();
        assert_eq!(r.body.code, "freemium_expired");
    }

    #[test]
    fn test_feature_off_is_subscription_required() {
        let f = fixture();
        f.subscriptions.grant_freemium_once(f.user).unwrap();
        let r = f.gate.require_feature(Some(&f.header), "export").unwrap_err();
        assert_eq!(r.status, 403);
        assert_eq!(r.body.code, "subscription_required");
    }

    #[test]
    fn test_product_token_passes_access_but_not_feature() {
        let f = fixture();
        f.tokens.issue("ABC123").unwrap();
        f.tokens.redeem(f.user, "ABC123").unwrap();

        assert!(f.gate.require_access(Some(&f.header)).is_ok());
        assert_eq!(
            f.gate
                .require_feature(Some(&f.header), "scan_ai")
                .unwrap_err()
                .body
                .code,
            "subscription_required"
        );
    }
}
