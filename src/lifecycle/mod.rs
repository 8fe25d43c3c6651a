//! Token and subscription lifecycles.

pub mod purchase;
pub mod subscription;
pub mod token;

pub use purchase::{PurchaseReceipt, PurchaseStage, PurchaseWorkflow};
pub use subscription::{FreemiumGrant, SubscriptionManager};
pub use token::{TokenCheck, TokenManager};
