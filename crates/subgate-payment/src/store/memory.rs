//! In-memory store
//!
//! Each operation holds one `DashMap` shard lock for its whole
//! check-and-set, which is what makes claims and upserts atomic here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use uuid::Uuid;

use crate::error::PaymentResult;
use crate::model::{
    IntentStatus, PaymentIntent, Plan, Profile, Subscription, SubscriptionStatus,
};
use crate::store::{IntentStore, ProfileStore, SignatureRegistry, SubscriptionStore};

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    intents: DashMap<Uuid, PaymentIntent>,
    signatures: DashSet<String>,
    subscriptions: DashMap<Uuid, Subscription>,
    profiles: DashMap<Uuid, Profile>,
    /// Wallet address to profile id
    wallets: DashMap<String, Uuid>,
    /// Email to the first profile that carried it
    emails: DashMap<String, Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_profile<F>(&self, predicate: F) -> Option<Profile>
    where
        F: Fn(&Profile) -> bool,
    {
        self.profiles
            .iter()
            .find(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl IntentStore for MemoryStore {
    async fn insert_intent(&self, intent: &PaymentIntent) -> PaymentResult<()> {
        self.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn get_intent(&self, id: Uuid) -> PaymentResult<Option<PaymentIntent>> {
        Ok(self.intents.get(&id).map(|i| i.value().clone()))
    }

    async fn complete_intent(
        &self,
        id: Uuid,
        signature: &str,
        completed_at: DateTime<Utc>,
    ) -> PaymentResult<bool> {
        match self.intents.get_mut(&id) {
            Some(mut intent) if intent.status == IntentStatus::Pending => {
                intent.status = IntentStatus::Completed;
                intent.transaction_signature = Some(signature.to_string());
                intent.completed_at = Some(completed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_intent(&self, id: Uuid) -> PaymentResult<bool> {
        match self.intents.get_mut(&id) {
            Some(mut intent) if intent.status == IntentStatus::Pending => {
                intent.status = IntentStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> PaymentResult<usize> {
        let mut expired = 0;
        for mut intent in self.intents.iter_mut() {
            if intent.status == IntentStatus::Pending && intent.is_expired_at(now) {
                intent.status = IntentStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl SignatureRegistry for MemoryStore {
    async fn claim_signature(
        &self,
        signature: &str,
        _context: &str,
        _claimed_at: DateTime<Utc>,
    ) -> PaymentResult<bool> {
        Ok(self.signatures.insert(signature.to_string()))
    }

    async fn is_claimed(&self, signature: &str) -> PaymentResult<bool> {
        Ok(self.signatures.contains(signature))
    }

    async fn release_signature(&self, signature: &str) -> PaymentResult<()> {
        self.signatures.remove(signature);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn upsert_active(&self, record: &Subscription) -> PaymentResult<Subscription> {
        let mut entry = self
            .subscriptions
            .entry(record.user_id)
            .or_insert_with(|| record.clone());

        let row = entry.value_mut();
        row.plan = record.plan;
        row.status = SubscriptionStatus::Active;
        row.current_period_end = row.current_period_end.max(record.current_period_end);
        row.payment_method = record.payment_method;
        if record.last_payment_signature.is_some() {
            row.last_payment_signature = record.last_payment_signature.clone();
        }
        if record.stripe_subscription_id.is_some() {
            row.stripe_subscription_id = record.stripe_subscription_id.clone();
        }
        if record.stripe_customer_id.is_some() {
            row.stripe_customer_id = record.stripe_customer_id.clone();
        }

        Ok(row.clone())
    }

    async fn downgrade(&self, user_id: Uuid) -> PaymentResult<Option<Subscription>> {
        Ok(self.subscriptions.get_mut(&user_id).map(|mut row| {
            row.status = SubscriptionStatus::Canceled;
            row.plan = Plan::Free;
            row.clone()
        }))
    }

    async fn apply_status(
        &self,
        user_id: Uuid,
        status: SubscriptionStatus,
        plan: Option<Plan>,
        period_end: Option<DateTime<Utc>>,
    ) -> PaymentResult<Option<Subscription>> {
        Ok(self.subscriptions.get_mut(&user_id).map(|mut row| {
            row.status = status;
            if let Some(plan) = plan {
                row.plan = plan;
            }
            if let Some(end) = period_end {
                row.current_period_end = row.current_period_end.max(end);
            }
            row.clone()
        }))
    }

    async fn get_subscription(&self, user_id: Uuid) -> PaymentResult<Option<Subscription>> {
        Ok(self.subscriptions.get(&user_id).map(|s| s.value().clone()))
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn get_profile(&self, id: Uuid) -> PaymentResult<Option<Profile>> {
        Ok(self.profiles.get(&id).map(|p| p.value().clone()))
    }

    async fn insert_profile(&self, profile: &Profile) -> PaymentResult<()> {
        if let Some(wallet) = &profile.wallet_address {
            self.wallets.insert(wallet.clone(), profile.id);
        }
        if let Some(email) = &profile.email {
            self.emails.entry(email.clone()).or_insert(profile.id);
        }
        self.profiles.insert(profile.id, profile.clone());
        Ok(())
    }

    async fn find_by_wallet(&self, wallet: &str) -> PaymentResult<Option<Profile>> {
        let id = match self.wallets.get(wallet) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get_profile(id).await
    }

    async fn find_by_email(&self, email: &str) -> PaymentResult<Option<Profile>> {
        let id = match self.emails.get(email) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get_profile(id).await
    }

    async fn find_by_customer(&self, customer_id: &str) -> PaymentResult<Option<Profile>> {
        Ok(self.find_profile(|p| p.stripe_customer_id.as_deref() == Some(customer_id)))
    }

    async fn get_or_create_wallet_profile(&self, wallet: &str) -> PaymentResult<Profile> {
        let id = match self.wallets.entry(wallet.to_string()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(slot) => {
                let profile = Profile::for_wallet(wallet);
                let id = profile.id;
                self.profiles.insert(id, profile);
                slot.insert(id);
                id
            }
        };

        Ok(self
            .profiles
            .get(&id)
            .map(|p| p.value().clone())
            .unwrap_or_else(|| Profile {
                id,
                ..Profile::for_wallet(wallet)
            }))
    }

    async fn get_or_create_email_profile(&self, email: &str) -> PaymentResult<Profile> {
        let id = match self.emails.entry(email.to_string()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(slot) => {
                let profile = Profile::for_email(email);
                let id = profile.id;
                self.profiles.insert(id, profile);
                slot.insert(id);
                id
            }
        };

        Ok(self
            .profiles
            .get(&id)
            .map(|p| p.value().clone())
            .unwrap_or_else(|| Profile {
                id,
                ..Profile::for_email(email)
            }))
    }

    async fn link_customer(
        &self,
        id: Uuid,
        customer_id: &str,
        email: Option<&str>,
    ) -> PaymentResult<()> {
        if let Some(mut profile) = self.profiles.get_mut(&id) {
            profile.stripe_customer_id = Some(customer_id.to_string());
            if profile.email.is_none() {
                if let Some(email) = email {
                    profile.email = Some(email.to_string());
                    self.emails.entry(email.to_string()).or_insert(id);
                }
            }
        }
        Ok(())
    }
}
