//! Tollgate configuration.
//!
//! Values are supplied by the embedding process and read once at start-up.
//! Nothing here is hot-swappable; restart to change a secret.

use crate::crypto::signature::CanonicalForm;
use crate::TollgateError;
use std::str::FromStr;
use std::time::Duration;

/// Reserved plan name for the one-time trial.
pub const DEFAULT_FREEMIUM_PLAN_NAME: &str = "Freemium Trial";

/// Trial length when not configured.
pub const DEFAULT_FREEMIUM_DURATION_DAYS: u32 = 14;

/// Product token validity when not configured.
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Outbound gateway timeout when not configured.
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Payment gateway deployment to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatewayEnvironment {
    /// Test credentials, no real money moves.
    #[default]
    Sandbox,
    /// Live credentials.
    Production,
}

impl GatewayEnvironment {
    /// Base URL of the core API (status, refund).
    pub fn api_base_url(&self) -> &'static str {
        match self {
            Self::Sandbox => "https://api.sandbox.midtrans.com",
            Self::Production => "https://api.midtrans.com",
        }
    }

    /// Base URL of the hosted checkout API (transaction creation).
    pub fn snap_base_url(&self) -> &'static str {
        match self {
            Self::Sandbox => "https://app.sandbox.midtrans.com",
            Self::Production => "https://app.midtrans.com",
        }
    }
}

impl FromStr for GatewayEnvironment {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "production" => Ok(Self::Production),
            other => Err(TollgateError::ConfigError(format!(
                "unknown gateway environment: {}",
                other
            ))),
        }
    }
}

/// Credentials and limits for the payment gateway.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Server key; doubles as the webhook signature secret.
    pub server_key: String,

    /// Sandbox or production.
    pub environment: GatewayEnvironment,

    /// Upper bound on every outbound gateway call.
    pub timeout: Duration,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("server_key", &"<redacted>")
            .field("environment", &self.environment)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Configuration for entitlement resolution and payment reconciliation.
#[derive(Clone)]
pub struct TollgateConfig {
    /// HS256 secret used to verify bearer tokens.
    pub jwt_secret: String,

    /// How long a redeemed product token stays valid.
    pub token_validity: Duration,

    /// Payment gateway settings.
    pub gateway: GatewayConfig,

    /// Plan name that marks a subscription as the freemium trial.
    pub freemium_plan_name: String,

    /// Length of the freemium trial in days.
    pub freemium_duration_days: u32,

    /// Link returned with every denial.
    pub upgrade_url: String,

    /// Canonical forms of `gross_amount` accepted by the webhook verifier.
    /// Narrow this to `[CanonicalForm::AsIs]` once the gateway contract is confirmed.
    pub accepted_signature_forms: Vec<CanonicalForm>,
}

impl std::fmt::Debug for TollgateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TollgateConfig")
            .field("jwt_secret", &"<redacted>")
            .field("token_validity", &self.token_validity)
            .field("gateway", &self.gateway)
            .field("freemium_plan_name", &self.freemium_plan_name)
            .field("freemium_duration_days", &self.freemium_duration_days)
            .field("upgrade_url", &self.upgrade_url)
            .field("accepted_signature_forms", &self.accepted_signature_forms)
            .finish()
    }
}

impl TollgateConfig {
    /// Build a config with defaults for everything but the two secrets.
    pub fn new(jwt_secret: impl Into<String>, server_key: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            token_validity: DEFAULT_TOKEN_VALIDITY,
            gateway: GatewayConfig {
                server_key: server_key.into(),
                environment: GatewayEnvironment::Sandbox,
                timeout: DEFAULT_GATEWAY_TIMEOUT,
            },
            freemium_plan_name: DEFAULT_FREEMIUM_PLAN_NAME.to_string(),
            freemium_duration_days: DEFAULT_FREEMIUM_DURATION_DAYS,
            upgrade_url: "/subscriptions/plans".to_string(),
            accepted_signature_forms: CanonicalForm::LEGACY.to_vec(),
        }
    }

    /// Load from `TOLLGATE_*` environment variables, reading `.env` first if present.
    pub fn from_env() -> Result<Self, TollgateError> {
        // A missing .env file is normal in production.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    ///
    /// Required: `TOLLGATE_JWT_SECRET`, `TOLLGATE_GATEWAY_SERVER_KEY`.
    /// Optional: `TOLLGATE_TOKEN_VALIDITY_DAYS`, `TOLLGATE_GATEWAY_ENV`,
    /// `TOLLGATE_GATEWAY_TIMEOUT_SECS`, `TOLLGATE_FREEMIUM_PLAN_NAME`,
    /// `TOLLGATE_FREEMIUM_DAYS`, `TOLLGATE_UPGRADE_URL`,
    /// `TOLLGATE_SIGNATURE_FORMS` (comma separated).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TollgateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| TollgateError::ConfigError(format!("{} is not set", key)))
        };

        let mut config = Self::new(
            required("TOLLGATE_JWT_SECRET")?,
            required("TOLLGATE_GATEWAY_SERVER_KEY")?,
        );

        if let Some(days) = lookup("TOLLGATE_TOKEN_VALIDITY_DAYS") {
            let days: u64 = parse_number("TOLLGATE_TOKEN_VALIDITY_DAYS", &days)?;
            config.token_validity = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Some(env) = lookup("TOLLGATE_GATEWAY_ENV") {
            config.gateway.environment = env.parse()?;
        }
        if let Some(secs) = lookup("TOLLGATE_GATEWAY_TIMEOUT_SECS") {
            config.gateway.timeout =
                Duration::from_secs(parse_number("TOLLGATE_GATEWAY_TIMEOUT_SECS", &secs)?);
        }
        if let Some(name) = lookup("TOLLGATE_FREEMIUM_PLAN_NAME") {
            config.freemium_plan_name = name;
        }
        if let Some(days) = lookup("TOLLGATE_FREEMIUM_DAYS") {
            config.freemium_duration_days = parse_number("TOLLGATE_FREEMIUM_DAYS", &days)?;
        }
        if let Some(url) = lookup("TOLLGATE_UPGRADE_URL") {
            config.upgrade_url = url;
        }
        if let Some(forms) = lookup("TOLLGATE_SIGNATURE_FORMS") {
            config.accepted_signature_forms = forms
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect::<Result<_, _>>()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), TollgateError> {
        if self.jwt_secret.is_empty() {
            return Err(TollgateError::ConfigError(
                "jwt_secret cannot be empty".to_string(),
            ));
        }
        if self.gateway.server_key.is_empty() {
            return Err(TollgateError::ConfigError(
                "gateway server_key cannot be empty".to_string(),
            ));
        }
        if self.gateway.timeout.is_zero() {
            return Err(TollgateError::ConfigError(
                "gateway timeout must be bounded and non-zero".to_string(),
            ));
        }
        if self.token_validity.is_zero() {
            return Err(TollgateError::ConfigError(
                "token_validity must be non-zero".to_string(),
            ));
        }
        if self.freemium_duration_days == 0 {
            return Err(TollgateError::ConfigError(
                "freemium_duration_days must be non-zero".to_string(),
            ));
        }
        if self.freemium_plan_name.trim().is_empty() {
            return Err(TollgateError::ConfigError(
                "freemium_plan_name cannot be empty".to_string(),
            ));
        }
        if self.accepted_signature_forms.is_empty() {
            return Err(TollgateError::ConfigError(
                "at least one signature form must be accepted".to_string(),
            ));
        }
        Ok(())
    }

    /// Token validity as a chrono duration for timestamp arithmetic.
    pub fn token_validity_chrono(&self) -> Result<chrono::Duration, TollgateError> {
        chrono::Duration::from_std(self.token_validity)
            .map_err(|e| TollgateError::ConfigError(format!("token_validity out of range: {}", e)))
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, TollgateError> {
    value
        .trim()
        .parse()
        .map_err(|_| TollgateError::ConfigError(format!("{} is not a number: {}", key, value)))
}
