//! Persistence seams
//!
//! Every write the engine depends on for correctness is a single atomic
//! operation on the backend: claiming a signature is an insert against a
//! unique key, activating a subscription is one keyed upsert, completing an
//! intent is a compare-and-set on `pending`. No caller does read-then-write.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::PaymentResult;
use crate::model::{PaymentIntent, Plan, Profile, Subscription, SubscriptionStatus};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Payment intents
#[async_trait]
pub trait IntentStore: Send + Sync {
    async fn insert_intent(&self, intent: &PaymentIntent) -> PaymentResult<()>;

    async fn get_intent(&self, id: Uuid) -> PaymentResult<Option<PaymentIntent>>;

    /// `pending -> completed`; `false` when the intent was no longer pending
    async fn complete_intent(
        &self,
        id: Uuid,
        signature: &str,
        completed_at: DateTime<Utc>,
    ) -> PaymentResult<bool>;

    /// `pending -> expired`; `false` when the intent was no longer pending
    async fn expire_intent(&self, id: Uuid) -> PaymentResult<bool>;

    /// Expire every pending intent whose window closed before `now`
    async fn expire_stale(&self, now: DateTime<Utc>) -> PaymentResult<usize>;
}

/// Consumed transaction signatures
#[async_trait]
pub trait SignatureRegistry: Send + Sync {
    /// Record `signature` as consumed. `false` if it already was.
    async fn claim_signature(
        &self,
        signature: &str,
        context: &str,
        claimed_at: DateTime<Utc>,
    ) -> PaymentResult<bool>;

    async fn is_claimed(&self, signature: &str) -> PaymentResult<bool>;

    /// Drop a claim whose work failed before granting anything
    async fn release_signature(&self, signature: &str) -> PaymentResult<()>;
}

/// Subscription rows keyed by user
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert or overwrite as active. The stored period end becomes
    /// `max(existing, record.current_period_end)`; rail ids left `None`
    /// keep their stored value.
    async fn upsert_active(&self, record: &Subscription) -> PaymentResult<Subscription>;

    /// Status `canceled`, plan `free`, period end untouched
    async fn downgrade(&self, user_id: Uuid) -> PaymentResult<Option<Subscription>>;

    /// Processor-driven status change; a period end only moves forward and
    /// `plan`, when given, replaces the stored one
    async fn apply_status(
        &self,
        user_id: Uuid,
        status: SubscriptionStatus,
        plan: Option<Plan>,
        period_end: Option<DateTime<Utc>>,
    ) -> PaymentResult<Option<Subscription>>;

    async fn get_subscription(&self, user_id: Uuid) -> PaymentResult<Option<Subscription>>;
}

/// User profiles
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, id: Uuid) -> PaymentResult<Option<Profile>>;

    async fn insert_profile(&self, profile: &Profile) -> PaymentResult<()>;

    async fn find_by_wallet(&self, wallet: &str) -> PaymentResult<Option<Profile>>;

    async fn find_by_email(&self, email: &str) -> PaymentResult<Option<Profile>>;

    async fn find_by_customer(&self, customer_id: &str) -> PaymentResult<Option<Profile>>;

    /// Existing profile for `wallet`, or a new minimal one
    async fn get_or_create_wallet_profile(&self, wallet: &str) -> PaymentResult<Profile>;

    /// Existing profile for `email`, or a new minimal one
    async fn get_or_create_email_profile(&self, email: &str) -> PaymentResult<Profile>;

    /// Attach processor identity to a profile, keeping any email already set
    async fn link_customer(
        &self,
        id: Uuid,
        customer_id: &str,
        email: Option<&str>,
    ) -> PaymentResult<()>;
}

/// Everything the engine persists
pub trait Store: IntentStore + SignatureRegistry + SubscriptionStore + ProfileStore {}

impl<T> Store for T where T: IntentStore + SignatureRegistry + SubscriptionStore + ProfileStore {}
