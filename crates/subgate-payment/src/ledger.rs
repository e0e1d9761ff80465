//! Subscription ledger
//!
//! The only writer of subscription rows. Both rails end here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::model::{Correlation, Plan, Subscription, SubscriptionStatus};
use crate::store::SubscriptionStore;

#[derive(Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionLedger {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Mark `user_id` active on `plan` until `period_end`.
    ///
    /// Repeating the same call leaves the row unchanged, and an earlier
    /// `period_end` never shortens an existing one.
    pub async fn upsert_active(
        &self,
        user_id: Uuid,
        plan: Plan,
        period_end: DateTime<Utc>,
        correlation: Correlation,
    ) -> PaymentResult<Subscription> {
        if period_end <= Utc::now() {
            return Err(PaymentError::InvalidPeriod);
        }

        let method = correlation.method();
        let (last_payment_signature, stripe_customer_id, stripe_subscription_id) = match correlation {
            Correlation::Transaction(signature) => (Some(signature), None, None),
            Correlation::Stripe {
                customer_id,
                subscription_id,
            } => (None, customer_id, subscription_id),
        };

        let record = Subscription {
            user_id,
            plan,
            status: SubscriptionStatus::Active,
            current_period_end: period_end,
            payment_method: method,
            last_payment_signature,
            stripe_subscription_id,
            stripe_customer_id,
        };

        let stored = self.store.upsert_active(&record).await.map_err(|e| {
            error!("Subscription upsert failed for {}: {}", user_id, e);
            e
        })?;

        info!(
            "Subscription active: user={} plan={} via {} until {}",
            user_id,
            stored.plan.as_str(),
            method.as_str(),
            stored.current_period_end
        );

        Ok(stored)
    }

    /// Cancel and drop to `free`; the period end is left as it was
    pub async fn downgrade(&self, user_id: Uuid) -> PaymentResult<Subscription> {
        let row = self
            .store
            .downgrade(user_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("subscription for {}", user_id)))?;

        info!("Subscription downgraded: user={}", user_id);
        Ok(row)
    }

    /// Status change reported by the card processor. An `active` status
    /// also restores the `pro` plan.
    pub async fn apply_processor_status(
        &self,
        user_id: Uuid,
        status: SubscriptionStatus,
        period_end: Option<DateTime<Utc>>,
    ) -> PaymentResult<Subscription> {
        let plan = (status == SubscriptionStatus::Active).then_some(Plan::Pro);
        let row = self
            .store
            .apply_status(user_id, status, plan, period_end)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("subscription for {}", user_id)))?;

        info!(
            "Subscription status: user={} status={} plan={} until {}",
            user_id,
            row.status.as_str(),
            row.plan.as_str(),
            row.current_period_end
        );
        Ok(row)
    }

    pub async fn get(&self, user_id: Uuid) -> PaymentResult<Option<Subscription>> {
        self.store.get_subscription(user_id).await
    }
}
