//! # Tollgate
//!
//! **Entitlement resolution and payment reconciliation for subscription-gated features.**
//!
//! Tollgate decides, on every request, whether a user may use a premium
//! feature. Access comes from one of three time-bounded sources:
//!
//! - a **subscription** (paid, or the one-time freemium trial)
//! - a single-use **product token**
//! - the **feature flags** of the active subscription plan
//!
//! Payment gateway webhooks are verified (SHA-512 signature), re-checked
//! against the gateway's status API, and applied idempotently.
//!
//! ## Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//! use tollgate::{MemoryStore, Tollgate, TollgateConfig};
//!
//! fn main() -> Result<(), tollgate::TollgateError> {
//!     let config = TollgateConfig::from_env()?;
//!     let tollgate = Tollgate::new(config, Arc::new(MemoryStore::new()))?;
//!
//!     match tollgate.require_feature(Some("Bearer eyJ..."), "scan_ai") {
//!         Ok(admitted) => println!("welcome {}", admitted.user.email),
//!         Err(rejection) => println!("{} {}", rejection.status, rejection.body.code),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Expiry
//!
//! There is no background job. Subscriptions past their end date are
//! simply not entitled when read; product tokens past their validity are
//! deleted by the first read that notices.
//!
//! ## Threat Model
//!
//! Tollgate protects against:
//! - **Spoofed webhooks** - signature mismatch, and the final status always comes from the gateway
//! - **Replayed webhooks** - processing is idempotent per order id
//! - **Double redemption** - a token code is claimed inside one store transaction
//!
//! The legacy signature forms accept a few alternative renderings of the
//! amount. Narrow [`TollgateConfig::accepted_signature_forms`] to
//! `[CanonicalForm::AsIs]` once the gateway contract allows it.
//!
//! See [`TollgateConfig`] for configuration.

#![warn(missing_docs)]
#![doc(html_root_url = "https://docs.rs/tollgate/0.1.0")]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;

// Crypto layer
pub mod crypto;

// Protocol layer
pub mod protocol;

// Client layer
pub mod client;

// Persistence layer
pub mod store;

// Lifecycle layer
pub mod lifecycle;

// Policy layer
pub mod policy;

// Webhook layer
pub mod webhook;

// Request gate
pub mod gate;

// Facade (main public API)
pub mod manager;

// Re-exports for public API
pub use client::{PaymentGateway, SnapGatewayClient};
pub use clock::{Clock, SystemClock};
pub use config::{GatewayConfig, GatewayEnvironment, TollgateConfig};
pub use crypto::signature::CanonicalForm;
pub use errors::TollgateError;
pub use gate::{AccessGate, Admitted, Rejection};
pub use lifecycle::{FreemiumGrant, PurchaseReceipt, TokenCheck};
pub use manager::{FeatureCheck, PurchaseView, SubscriptionView, TokenView, Tollgate};
pub use policy::{Access, AccessType, DenyCode, ScanCaps};
pub use store::{EntitlementStore, FileStore, MemoryStore};
pub use webhook::ReconcileOutcome;

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
