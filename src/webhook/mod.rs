//! Inbound payment notification handling.

pub mod reconciler;

pub use reconciler::{PaymentReconciler, ReconcileOutcome};
