//! Product token lifecycle: redeem, expire, revoke.
//!
//! Expiry is lazy. There is no sweeper; the first read that sees an
//! expired token deletes it.

use crate::clock::Clock;
use crate::store::{EntitlementStore, ProductToken};
use crate::TollgateError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Result of [`TokenManager::check_and_expire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    /// Still usable; `expires_at` is `None` for an unredeemed token.
    Valid {
        /// When the token stops granting access.
        expires_at: Option<DateTime<Utc>>,
    },
    /// Past its validity; the row has been deleted.
    Expired,
}

/// Redeems and expires product tokens.
pub struct TokenManager {
    store: Arc<dyn EntitlementStore>,
    clock: Arc<dyn Clock>,
    validity: chrono::Duration,
}

impl TokenManager {
    /// Create a manager with the configured validity window.
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        clock: Arc<dyn Clock>,
        validity: chrono::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            validity,
        }
    }

    /// Configured validity window.
    pub fn validity(&self) -> chrono::Duration {
        self.validity
    }

    /// Create an unredeemed token (seeding / admin).
    pub fn issue(&self, code: &str) -> Result<ProductToken, TollgateError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(TollgateError::ProtocolError(
                "token code cannot be empty".to_string(),
            ));
        }
        let token = ProductToken::new(code, self.clock.now_utc());
        self.store.insert_token(token.clone())?;
        Ok(token)
    }

    /// Redeem `code` for `user_id`.
    ///
    /// # Errors
    /// * `AlreadyHasToken` - The user holds an unexpired token
    /// * `InvalidOrUsedToken` - No unredeemed token matches `code`
    pub fn redeem(&self, user_id: Uuid, code: &str) -> Result<ProductToken, TollgateError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(TollgateError::InvalidOrUsedToken);
        }

        let now = self.clock.now_utc();
        match self.store.redeem_token(user_id, code, now, self.validity) {
            Ok(token) => {
                tracing::info!(user_id = %user_id, token_id = %token.id, "product token redeemed");
                Ok(token)
            }
            Err(e) => {
                tracing::debug!(user_id = %user_id, error = %e, "product token redemption refused");
                Err(e)
            }
        }
    }

    /// Check a token against the clock, deleting it if expired.
    ///
    /// This is a read with a side effect: an `Expired` answer means the row
    /// is already gone.
    pub fn check_and_expire(&self, token: &ProductToken) -> Result<TokenCheck, TollgateError> {
        let now = self.clock.now_utc();
        if !token.is_expired_at(now, self.validity) {
            return Ok(TokenCheck::Valid {
                expires_at: token.expires_at(self.validity),
            });
        }

        if self.store.delete_token_if_expired(token.id, now, self.validity)? {
            tracing::info!(
                token_id = %token.id,
                user_id = ?token.user_id,
                "expired product token deleted"
            );
        }
        Ok(TokenCheck::Expired)
    }

    /// The user's token and its expiry, if it is still valid.
    pub fn current(
        &self,
        user_id: Uuid,
    ) -> Result<Option<(ProductToken, DateTime<Utc>)>, TollgateError> {
        let Some(token) = self.store.token_for_user(user_id)? else {
            return Ok(None);
        };

        match self.check_and_expire(&token)? {
            TokenCheck::Valid {
                expires_at: Some(expires_at),
            } => Ok(Some((token, expires_at))),
            _ => Ok(None),
        }
    }
}
