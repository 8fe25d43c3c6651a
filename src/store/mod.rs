//! Persistence seam for entitlement state.
//!
//! The engine only needs a narrow slice of the application's database:
//! users, product tokens, plans, subscriptions and transaction details.
//! Every mutation that must be atomic is a single trait method, so an
//! implementation can run it inside one transaction with its uniqueness
//! constraints as the final race-breaker.

pub mod entities;
pub mod file;
pub mod memory;
pub mod tables;

pub use entities::{
    PaymentStatus, ProductToken, SubscriptionPlan, TransactionDetail, User, UserSubscription,
    FREEMIUM_PAYMENT_METHOD,
};
pub use file::FileStore;
pub use memory::MemoryStore;

use crate::TollgateError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// State change a gateway status implies for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionTransition {
    /// Mark completed and active. Ignored for a row that was activated before.
    Activate {
        /// Period start.
        start: DateTime<Utc>,
        /// Period end.
        end: DateTime<Utc>,
    },
    /// Mark failed and inactive.
    Deactivate,
    /// Leave the subscription as it is.
    Unchanged,
}

/// Storage operations the engine relies on.
pub trait EntitlementStore: Send + Sync {
    /// Fetch a user by id.
    fn get_user(&self, user_id: Uuid) -> Result<Option<User>, TollgateError>;

    /// Insert or replace a user.
    fn put_user(&self, user: User) -> Result<(), TollgateError>;

    /// Insert an unredeemed token. Fails `Conflict` on a duplicate code.
    fn insert_token(&self, token: ProductToken) -> Result<(), TollgateError>;

    /// The token owned by a user, if any.
    fn token_for_user(&self, user_id: Uuid) -> Result<Option<ProductToken>, TollgateError>;

    /// Look a token up by code.
    fn token_by_code(&self, code: &str) -> Result<Option<ProductToken>, TollgateError>;

    /// Atomically redeem `code` for `user_id`.
    ///
    /// An expired token already held by the user is deleted first. Fails
    /// `AlreadyHasToken` if the user holds an unexpired token and
    /// `InvalidOrUsedToken` if no unredeemed token matches.
    fn redeem_token(
        &self,
        user_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
        validity: chrono::Duration,
    ) -> Result<ProductToken, TollgateError>;

    /// Delete a token if it is expired at `now`. Returns whether it was deleted.
    fn delete_token_if_expired(
        &self,
        token_id: Uuid,
        now: DateTime<Utc>,
        validity: chrono::Duration,
    ) -> Result<bool, TollgateError>;

    /// Insert or replace a plan.
    fn put_plan(&self, plan: SubscriptionPlan) -> Result<(), TollgateError>;

    /// Fetch a plan by id.
    fn get_plan(&self, plan_id: Uuid) -> Result<Option<SubscriptionPlan>, TollgateError>;

    /// Fetch a plan by exact name.
    fn plan_by_name(&self, name: &str) -> Result<Option<SubscriptionPlan>, TollgateError>;

    /// All plans.
    fn list_plans(&self) -> Result<Vec<SubscriptionPlan>, TollgateError>;

    /// All subscription rows of a user, newest first.
    fn subscriptions_for_user(&self, user_id: Uuid)
        -> Result<Vec<UserSubscription>, TollgateError>;

    /// The subscription carrying a merchant order id.
    fn subscription_by_order(
        &self,
        order_id: &str,
    ) -> Result<Option<UserSubscription>, TollgateError>;

    /// Atomically deactivate the user's active rows and insert `subscription`.
    fn insert_superseding(
        &self,
        subscription: UserSubscription,
        now: DateTime<Utc>,
    ) -> Result<UserSubscription, TollgateError>;

    /// Atomically insert `subscription` unless the user has any subscription row.
    /// Returns `None` when a row already existed.
    fn insert_freemium_if_absent(
        &self,
        subscription: UserSubscription,
    ) -> Result<Option<UserSubscription>, TollgateError>;

    /// Apply a payment transition to the subscription carrying `order_id`.
    fn apply_transition(
        &self,
        order_id: &str,
        transition: SubscriptionTransition,
        now: DateTime<Utc>,
    ) -> Result<UserSubscription, TollgateError>;

    /// Atomically check the plan's scan quota and count one scan against
    /// the user's entitled subscription.
    fn increment_scan_usage(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UserSubscription, TollgateError>;

    /// Atomically apply `transition` to the subscription carrying
    /// `detail.order_id` and fold the delivery into that order's detail row.
    ///
    /// With `None` only the detail is written. If the transition fails,
    /// neither change is kept.
    fn record_delivery(
        &self,
        detail: TransactionDetail,
        transition: Option<SubscriptionTransition>,
        now: DateTime<Utc>,
    ) -> Result<(TransactionDetail, Option<UserSubscription>), TollgateError>;

    /// Fetch the detail row for an order.
    fn transaction_detail(&self, order_id: &str)
        -> Result<Option<TransactionDetail>, TollgateError>;
}
