//! HS256 bearer tokens.
//!
//! Expiry is checked against the injected clock rather than the library's
//! wall-clock check, so tests can move time.

use crate::clock::Clock;
use crate::TollgateError;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: Uuid,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Issued at, unix seconds.
    #[serde(default)]
    pub iat: i64,
}

/// Signs and verifies session tokens with a shared secret.
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    clock: Arc<dyn Clock>,
}

impl JwtVerifier {
    /// Create a verifier for `secret`.
    pub fn new(secret: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            clock,
        }
    }

    /// Issue a token for `user_id` valid for `ttl`.
    pub fn issue(&self, user_id: Uuid, ttl: chrono::Duration) -> Result<String, TollgateError> {
        let now = self.clock.now_utc();
        let claims = Claims {
            sub: user_id,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TollgateError::ConfigError(format!("Failed to sign token: {}", e)))
    }

    /// Verify a token and return its claims.
    ///
    /// # Errors
    /// * `Unauthenticated` - Bad signature, malformed, or expired
    pub fn verify(&self, token: &str) -> Result<Claims, TollgateError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            tracing::debug!(error = %e, "bearer token rejected");
            match e.kind() {
                ErrorKind::InvalidSignature => {
                    TollgateError::Unauthenticated("Invalid token signature".to_string())
                }
                ErrorKind::MissingRequiredClaim(claim) => {
                    TollgateError::Unauthenticated(format!("Token missing claim: {}", claim))
                }
                _ => TollgateError::Unauthenticated("Invalid token".to_string()),
            }
        })?;

        if data.claims.exp <= self.clock.now_utc().timestamp() {
            return Err(TollgateError::Unauthenticated(
                "Token has expired".to_string(),
            ));
        }
        Ok(data.claims)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, TollgateError> {
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TollgateError::Unauthenticated("Missing authorization header".to_string()))?;

    let token = header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| {
            TollgateError::Unauthenticated("Invalid authorization header format".to_string())
        })?;

    if token.is_empty() {
        return Err(TollgateError::Unauthenticated(
            "Empty bearer token".to_string(),
        ));
    }
    Ok(token)
}
