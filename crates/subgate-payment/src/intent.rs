//! Payment intent service
//!
//! Direct-transfer rail: record what a payment must look like, then accept a
//! transaction signature as proof. The intent flow and the walk-up flow claim
//! signatures through the same replay guard.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::ledger::SubscriptionLedger;
use crate::memo::{new_memo, walkup_memo};
use crate::model::{
    BillingPlan, Correlation, Currency, IntentStatus, PaymentIntent, Plan, Subscription,
};
use crate::onchain::{OnChainVerifier, Verification, VerifiedTransfer};
use crate::pricing::{format_amount, AmountPolicy};
use crate::replay::ReplayGuard;
use crate::store::{IntentStore, ProfileStore, Store};
use crate::INTENT_TTL_MINUTES;

/// Result of a successful activation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activation {
    pub user_id: Uuid,
    pub plan: Plan,
    pub billing_plan: BillingPlan,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

impl Activation {
    fn from_subscription(row: &Subscription, billing_plan: BillingPlan, signature: &str) -> Self {
        Self {
            user_id: row.user_id,
            plan: row.plan,
            billing_plan,
            expires_at: row.current_period_end,
            signature: signature.to_string(),
        }
    }
}

/// Intent-based and walk-up crypto activation
pub struct PaymentIntentManager {
    intents: Arc<dyn IntentStore>,
    profiles: Arc<dyn ProfileStore>,
    policy: AmountPolicy,
    verifier: OnChainVerifier,
    replay: ReplayGuard,
    ledger: SubscriptionLedger,
}

impl PaymentIntentManager {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        policy: AmountPolicy,
        verifier: OnChainVerifier,
    ) -> Self {
        Self {
            intents: store.clone(),
            profiles: store.clone(),
            policy,
            verifier,
            replay: ReplayGuard::new(store.clone()),
            ledger: SubscriptionLedger::new(store),
        }
    }

    /// Address payers must send to
    pub fn treasury_address(&self) -> &str {
        &self.verifier.treasury().address
    }

    pub fn policy(&self) -> &AmountPolicy {
        &self.policy
    }

    /// Record a pending intent for `user_id`
    pub async fn create_intent(
        &self,
        user_id: Uuid,
        plan: BillingPlan,
        currency: Currency,
    ) -> PaymentResult<PaymentIntent> {
        if self.profiles.get_profile(user_id).await?.is_none() {
            return Err(PaymentError::NotFound(format!("user {}", user_id)));
        }

        let now = Utc::now();
        let intent = PaymentIntent {
            id: Uuid::new_v4(),
            user_id,
            plan,
            amount: self.policy.price_for(plan, currency),
            currency,
            memo: new_memo(&user_id),
            status: IntentStatus::Pending,
            created_at: now,
            expires_at: now + chrono::Duration::minutes(INTENT_TTL_MINUTES),
            transaction_signature: None,
            completed_at: None,
        };

        self.intents.insert_intent(&intent).await?;

        info!(
            "Created payment intent {} for user {}: {} ({}), memo {}",
            intent.id,
            user_id,
            plan,
            format_amount(intent.amount, currency),
            intent.memo
        );

        Ok(intent)
    }

    pub async fn get_intent(&self, id: Uuid) -> PaymentResult<Option<PaymentIntent>> {
        self.intents.get_intent(id).await
    }

    /// Settle intent `intent_id` with transaction `reference`
    pub async fn activate(&self, intent_id: Uuid, reference: &str) -> PaymentResult<Activation> {
        let intent = self
            .intents
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment intent {}", intent_id)))?;

        match intent.status {
            IntentStatus::Completed => return self.resume_completed(&intent, reference).await,
            IntentStatus::Expired => return Err(PaymentError::Expired),
            IntentStatus::Pending => {}
        }

        if intent.is_expired_at(Utc::now()) {
            if self.intents.expire_intent(intent.id).await? {
                info!("Payment intent {} expired", intent.id);
            }
            return Err(PaymentError::Expired);
        }

        let context = format!("intent:{}", intent.id);
        self.verify_proof(reference, intent.currency, intent.amount, &intent.memo, &context)
            .await?;
        self.claim(reference, &context).await?;

        let now = Utc::now();
        if !self.intents.complete_intent(intent.id, reference, now).await? {
            // Another request settled this intent first; `reference` stays consumed.
            warn!(
                "Payment intent {} settled concurrently, {} not applied",
                intent.id, reference
            );
            return Err(PaymentError::AlreadyProcessed);
        }

        let period_end = AmountPolicy::period_end(intent.plan, now);
        let row = self
            .record(intent.user_id, intent.plan, period_end, reference, &context)
            .await?;

        Ok(Activation::from_subscription(&row, intent.plan, reference))
    }

    /// A completed intent is a duplicate unless its subscription write never
    /// landed, in which case the recorded signature is applied again.
    async fn resume_completed(
        &self,
        intent: &PaymentIntent,
        reference: &str,
    ) -> PaymentResult<Activation> {
        if intent.transaction_signature.as_deref() != Some(reference) {
            return Err(PaymentError::AlreadyProcessed);
        }
        if self.ledger.get(intent.user_id).await?.is_some() {
            return Err(PaymentError::AlreadyProcessed);
        }

        warn!(
            "Payment intent {} completed without a subscription, applying {} again",
            intent.id, reference
        );

        let settled_at = intent.completed_at.unwrap_or_else(Utc::now);
        let period_end = AmountPolicy::period_end(intent.plan, settled_at);
        let context = format!("intent:{}", intent.id);
        let row = self
            .record(intent.user_id, intent.plan, period_end, reference, &context)
            .await?;

        Ok(Activation::from_subscription(&row, intent.plan, reference))
    }

    /// Walk-up flow: a wallet proves a payment without a prior intent
    pub async fn activate_wallet(
        &self,
        wallet: &str,
        plan: BillingPlan,
        reference: &str,
        currency: Option<Currency>,
    ) -> PaymentResult<Activation> {
        let wallet = wallet.trim();
        if wallet.is_empty() {
            return Err(PaymentError::InvalidPayload("wallet address is required".into()));
        }

        let currency = currency.unwrap_or(Currency::Usdc);
        let amount = self.policy.price_for(plan, currency);
        let memo = walkup_memo(wallet, plan);
        let context = format!("wallet:{}", wallet);

        self.verify_proof(reference, currency, amount, &memo, &context)
            .await?;
        if self.replay.is_used(reference).await? {
            return Err(PaymentError::ReplayDetected);
        }

        // Resolved before the claim: once `reference` is consumed nothing
        // but the ledger write may fail.
        let profile = self.profiles.get_or_create_wallet_profile(wallet).await?;
        self.claim(reference, &context).await?;

        let period_end = AmountPolicy::period_end(plan, Utc::now());
        let row = self
            .record(profile.id, plan, period_end, reference, &context)
            .await?;

        info!("Walk-up activation for wallet {} ({})", wallet, plan);
        Ok(Activation::from_subscription(&row, plan, reference))
    }

    /// Expire every pending intent past its window
    pub async fn sweep_expired(&self) -> PaymentResult<usize> {
        let expired = self.intents.expire_stale(Utc::now()).await?;
        if expired > 0 {
            info!("Expired {} stale payment intents", expired);
        } else {
            debug!("No stale payment intents");
        }
        Ok(expired)
    }

    async fn verify_proof(
        &self,
        reference: &str,
        currency: Currency,
        amount: u64,
        memo: &str,
        context: &str,
    ) -> PaymentResult<VerifiedTransfer> {
        match self.verifier.verify(reference, currency, amount, memo).await? {
            Verification::Valid(transfer) => Ok(transfer),
            Verification::Invalid(reason) => {
                info!("Verification of {} for {} failed: {}", reference, context, reason);
                Err(PaymentError::VerificationFailed(reason))
            }
        }
    }

    async fn claim(&self, reference: &str, context: &str) -> PaymentResult<()> {
        if !self.replay.claim(reference, context).await? {
            return Err(PaymentError::ReplayDetected);
        }
        Ok(())
    }

    /// Ledger write for a consumed `reference`
    async fn record(
        &self,
        user_id: Uuid,
        plan: BillingPlan,
        period_end: DateTime<Utc>,
        reference: &str,
        context: &str,
    ) -> PaymentResult<Subscription> {
        self.ledger
            .upsert_active(
                user_id,
                plan.tier(),
                period_end,
                Correlation::Transaction(reference.to_string()),
            )
            .await
            .map_err(|e| {
                error!(
                    "Signature {} consumed by {} but no subscription written for {}: {}",
                    reference, context, user_id, e
                );
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::config::SubgateConfig;
    use crate::model::{PaymentMethod, Profile, SubscriptionStatus};
    use crate::onchain::tests::{signature, treasury, usdc_payment};
    use crate::onchain::RejectReason;
    use crate::solana::InMemoryChain;
    use crate::store::{MemoryStore, SignatureRegistry, SubscriptionStore};

    struct Fixture {
        manager: Arc<PaymentIntentManager>,
        chain: Arc<InMemoryChain>,
        store: Arc<MemoryStore>,
        user: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(InMemoryChain::new());
        let verifier = OnChainVerifier::new(chain.clone(), treasury(), ChronoDuration::seconds(3600));
        let policy = AmountPolicy::from_config(&SubgateConfig::default().pricing).unwrap();
        let manager = Arc::new(PaymentIntentManager::new(store.clone(), policy, verifier));

        let profile = Profile::for_email("payer@example.com");
        store.insert_profile(&profile).await.unwrap();

        Fixture {
            manager,
            chain,
            store,
            user: profile.id,
        }
    }

    /// Memory store whose subscription and profile writes can be switched off
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_upserts: AtomicBool,
        fail_profiles: AtomicBool,
    }

    fn outage(flag: &AtomicBool) -> PaymentResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(PaymentError::Storage("disk unavailable".into()));
        }
        Ok(())
    }

    #[async_trait]
    impl IntentStore for FlakyStore {
        async fn insert_intent(&self, intent: &PaymentIntent) -> PaymentResult<()> {
            self.inner.insert_intent(intent).await
        }

        async fn get_intent(&self, id: Uuid) -> PaymentResult<Option<PaymentIntent>> {
            self.inner.get_intent(id).await
        }

        async fn complete_intent(
            &self,
            id: Uuid,
            signature: &str,
            completed_at: DateTime<Utc>,
        ) -> PaymentResult<bool> {
            self.inner.complete_intent(id, signature, completed_at).await
        }

        async fn expire_intent(&self, id: Uuid) -> PaymentResult<bool> {
            self.inner.expire_intent(id).await
        }

        async fn expire_stale(&self, now: DateTime<Utc>) -> PaymentResult<usize> {
            self.inner.expire_stale(now).await
        }
    }

    #[async_trait]
    impl SignatureRegistry for FlakyStore {
        async fn claim_signature(
            &self,
            signature: &str,
            context: &str,
            claimed_at: DateTime<Utc>,
        ) -> PaymentResult<bool> {
            self.inner.claim_signature(signature, context, claimed_at).await
        }

        async fn is_claimed(&self, signature: &str) -> PaymentResult<bool> {
            self.inner.is_claimed(signature).await
        }

        async fn release_signature(&self, signature: &str) -> PaymentResult<()> {
            self.inner.release_signature(signature).await
        }
    }

    #[async_trait]
    impl SubscriptionStore for FlakyStore {
        async fn upsert_active(&self, record: &Subscription) -> PaymentResult<Subscription> {
            outage(&self.fail_upserts)?;
            self.inner.upsert_active(record).await
        }

        async fn downgrade(&self, user_id: Uuid) -> PaymentResult<Option<Subscription>> {
            self.inner.downgrade(user_id).await
        }

        async fn apply_status(
            &self,
            user_id: Uuid,
            status: SubscriptionStatus,
            plan: Option<Plan>,
            period_end: Option<DateTime<Utc>>,
        ) -> PaymentResult<Option<Subscription>> {
            self.inner.apply_status(user_id, status, plan, period_end).await
        }

        async fn get_subscription(&self, user_id: Uuid) -> PaymentResult<Option<Subscription>> {
            self.inner.get_subscription(user_id).await
        }
    }

    #[async_trait]
    impl ProfileStore for FlakyStore {
        async fn get_profile(&self, id: Uuid) -> PaymentResult<Option<Profile>> {
            self.inner.get_profile(id).await
        }

        async fn insert_profile(&self, profile: &Profile) -> PaymentResult<()> {
            self.inner.insert_profile(profile).await
        }

        async fn find_by_wallet(&self, wallet: &str) -> PaymentResult<Option<Profile>> {
            self.inner.find_by_wallet(wallet).await
        }

        async fn find_by_email(&self, email: &str) -> PaymentResult<Option<Profile>> {
            self.inner.find_by_email(email).await
        }

        async fn find_by_customer(&self, customer_id: &str) -> PaymentResult<Option<Profile>> {
            self.inner.find_by_customer(customer_id).await
        }

        async fn get_or_create_wallet_profile(&self, wallet: &str) -> PaymentResult<Profile> {
            outage(&self.fail_profiles)?;
            self.inner.get_or_create_wallet_profile(wallet).await
        }

        async fn get_or_create_email_profile(&self, email: &str) -> PaymentResult<Profile> {
            outage(&self.fail_profiles)?;
            self.inner.get_or_create_email_profile(email).await
        }

        async fn link_customer(
            &self,
            id: Uuid,
            customer_id: &str,
            email: Option<&str>,
        ) -> PaymentResult<()> {
            self.inner.link_customer(id, customer_id, email).await
        }
    }

    fn flaky_manager(store: Arc<FlakyStore>, chain: Arc<InMemoryChain>) -> PaymentIntentManager {
        let verifier = OnChainVerifier::new(chain, treasury(), ChronoDuration::seconds(3600));
        let policy = AmountPolicy::from_config(&SubgateConfig::default().pricing).unwrap();
        PaymentIntentManager::new(store, policy, verifier)
    }

    #[tokio::test]
    async fn test_failed_ledger_write_is_resumed() {
        let store = Arc::new(FlakyStore::default());
        let chain = Arc::new(InMemoryChain::new());
        let manager = flaky_manager(store.clone(), chain.clone());

        let profile = Profile::for_email("flaky@example.com");
        store.insert_profile(&profile).await.unwrap();
        let intent = manager
            .create_intent(profile.id, BillingPlan::ProMonthly, Currency::Usdc)
            .await
            .unwrap();
        let sig = signature("Resumed");
        chain.insert(usdc_payment(&sig, intent.amount, fresh(), None));

        store.fail_upserts.store(true, Ordering::SeqCst);
        assert!(matches!(
            manager.activate(intent.id, &sig).await,
            Err(PaymentError::Storage(_))
        ));
        assert!(store.is_claimed(&sig).await.unwrap());
        assert!(store.get_subscription(profile.id).await.unwrap().is_none());

        store.fail_upserts.store(false, Ordering::SeqCst);
        let other = signature("Other");
        assert!(matches!(
            manager.activate(intent.id, &other).await,
            Err(PaymentError::AlreadyProcessed)
        ));

        let activation = manager.activate(intent.id, &sig).await.unwrap();
        assert_eq!(activation.user_id, profile.id);
        assert_eq!(activation.plan, Plan::Pro);

        let row = store.get_subscription(profile.id).await.unwrap().unwrap();
        assert_eq!(row.last_payment_signature.as_deref(), Some(sig.as_str()));
        assert_eq!(row.current_period_end, activation.expires_at);

        assert!(matches!(
            manager.activate(intent.id, &sig).await,
            Err(PaymentError::AlreadyProcessed)
        ));
    }

    #[tokio::test]
    async fn test_walkup_profile_failure_keeps_signature_unused() {
        let store = Arc::new(FlakyStore::default());
        let chain = Arc::new(InMemoryChain::new());
        let manager = flaky_manager(store.clone(), chain.clone());

        let sig = signature("ProfileDown");
        chain.insert(usdc_payment(&sig, 9_990_000, fresh(), None));

        store.fail_profiles.store(true, Ordering::SeqCst);
        assert!(matches!(
            manager
                .activate_wallet("FlakyWa11et", BillingPlan::ProMonthly, &sig, None)
                .await,
            Err(PaymentError::Storage(_))
        ));
        assert!(!store.is_claimed(&sig).await.unwrap());

        store.fail_profiles.store(false, Ordering::SeqCst);
        let activation = manager
            .activate_wallet("FlakyWa11et", BillingPlan::ProMonthly, &sig, None)
            .await
            .unwrap();
        let profile = store.find_by_wallet("FlakyWa11et").await.unwrap().unwrap();
        assert_eq!(activation.user_id, profile.id);
    }

    fn fresh() -> i64 {
        Utc::now().timestamp() - 30
    }

    #[tokio::test]
    async fn test_yearly_usdc_end_to_end() {
        let f = fixture().await;
        let intent = f
            .manager
            .create_intent(f.user, BillingPlan::ProYearly, Currency::Usdc)
            .await
            .unwrap();
        assert_eq!(intent.amount, 99_990_000);
        assert_eq!(intent.status, IntentStatus::Pending);
        assert!(intent.expires_at - intent.created_at == ChronoDuration::minutes(30));

        let sig = signature("Yearly");
        f.chain
            .insert(usdc_payment(&sig, intent.amount, fresh(), Some(&intent.memo)));

        let activation = f.manager.activate(intent.id, &sig).await.unwrap();
        assert_eq!(activation.plan, Plan::Pro);
        assert_eq!(activation.user_id, f.user);
        let days = (activation.expires_at - Utc::now()).num_days();
        assert!((364..=366).contains(&days), "period was {} days", days);

        let stored = f.manager.get_intent(intent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IntentStatus::Completed);
        assert_eq!(stored.transaction_signature.as_deref(), Some(sig.as_str()));

        let sub = f.store.get_subscription(f.user).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.payment_method, PaymentMethod::Crypto);

        let replay = f
            .manager
            .activate_wallet("PayerWa11et", BillingPlan::ProYearly, &sig, Some(Currency::Usdc))
            .await;
        assert!(matches!(replay, Err(PaymentError::ReplayDetected)));
        assert!(f.store.find_by_wallet("PayerWa11et").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_verify_is_already_processed() {
        let f = fixture().await;
        let intent = f
            .manager
            .create_intent(f.user, BillingPlan::ProMonthly, Currency::Usdc)
            .await
            .unwrap();
        let sig = signature("Twice");
        f.chain.insert(usdc_payment(&sig, intent.amount, fresh(), None));

        f.manager.activate(intent.id, &sig).await.unwrap();
        assert!(matches!(
            f.manager.activate(intent.id, &sig).await,
            Err(PaymentError::AlreadyProcessed)
        ));
    }

    #[tokio::test]
    async fn test_expired_intent_never_reaches_chain() {
        let f = fixture().await;
        let now = Utc::now();
        let stale = PaymentIntent {
            id: Uuid::new_v4(),
            user_id: f.user,
            plan: BillingPlan::ProMonthly,
            amount: 9_990_000,
            currency: Currency::Usdc,
            memo: "OLD".to_string(),
            status: IntentStatus::Pending,
            created_at: now - ChronoDuration::minutes(31),
            expires_at: now - ChronoDuration::minutes(1),
            transaction_signature: None,
            completed_at: None,
        };
        f.store.insert_intent(&stale).await.unwrap();

        let sig = signature("Late");
        f.chain.insert(usdc_payment(&sig, 9_990_000, fresh(), None));

        assert!(matches!(
            f.manager.activate(stale.id, &sig).await,
            Err(PaymentError::Expired)
        ));
        assert_eq!(f.chain.lookups(), 0);
        assert_eq!(
            f.manager.get_intent(stale.id).await.unwrap().unwrap().status,
            IntentStatus::Expired
        );

        assert!(matches!(
            f.manager.activate(stale.id, &sig).await,
            Err(PaymentError::Expired)
        ));
        assert_eq!(f.chain.lookups(), 0);
    }

    #[tokio::test]
    async fn test_failed_verification_leaves_intent_pending() {
        let f = fixture().await;
        let intent = f
            .manager
            .create_intent(f.user, BillingPlan::ProMonthly, Currency::Usdc)
            .await
            .unwrap();

        let short = signature("Short");
        f.chain.insert(usdc_payment(&short, intent.amount / 2, fresh(), None));

        let result = f.manager.activate(intent.id, &short).await;
        assert!(matches!(
            result,
            Err(PaymentError::VerificationFailed(RejectReason::InsufficientAmount { .. }))
        ));
        assert_eq!(
            f.manager.get_intent(intent.id).await.unwrap().unwrap().status,
            IntentStatus::Pending
        );
        assert!(f.store.get_subscription(f.user).await.unwrap().is_none());

        let missing = signature("Missing");
        let result = f.manager.activate(intent.id, &missing).await;
        match result {
            Err(e @ PaymentError::VerificationFailed(RejectReason::NotFound)) => {
                assert!(e.is_retriable())
            }
            other => panic!("unexpected: {:?}", other),
        }

        let good = signature("Good");
        f.chain.insert(usdc_payment(&good, intent.amount, fresh(), None));
        assert!(f.manager.activate(intent.id, &good).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_user_and_intent() {
        let f = fixture().await;
        assert!(matches!(
            f.manager
                .create_intent(Uuid::new_v4(), BillingPlan::ProMonthly, Currency::Sol)
                .await,
            Err(PaymentError::NotFound(_))
        ));
        assert!(matches!(
            f.manager.activate(Uuid::new_v4(), &signature("X")).await,
            Err(PaymentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_walkup_creates_profile() {
        let f = fixture().await;
        let sig = signature("Walkup");
        f.chain.insert(usdc_payment(&sig, 9_990_000, fresh(), None));

        let activation = f
            .manager
            .activate_wallet("NewWa11et", BillingPlan::ProMonthly, &sig, None)
            .await
            .unwrap();

        let profile = f.store.find_by_wallet("NewWa11et").await.unwrap().unwrap();
        assert_eq!(activation.user_id, profile.id);
        assert_eq!(activation.billing_plan, BillingPlan::ProMonthly);
    }

    #[tokio::test]
    async fn test_intent_cannot_reuse_walkup_signature() {
        let f = fixture().await;
        let sig = signature("WalkFirst");
        f.chain.insert(usdc_payment(&sig, 9_990_000, fresh(), None));

        f.manager
            .activate_wallet("SomeWa11et", BillingPlan::ProMonthly, &sig, Some(Currency::Usdc))
            .await
            .unwrap();

        let intent = f
            .manager
            .create_intent(f.user, BillingPlan::ProMonthly, Currency::Usdc)
            .await
            .unwrap();
        assert!(matches!(
            f.manager.activate(intent.id, &sig).await,
            Err(PaymentError::ReplayDetected)
        ));
        assert_eq!(
            f.manager.get_intent(intent.id).await.unwrap().unwrap().status,
            IntentStatus::Pending
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_activations_single_winner() {
        let f = fixture().await;
        let sig = signature("Race");
        f.chain.insert(usdc_payment(&sig, 9_990_000, fresh(), None));

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = f.manager.clone();
            let sig = sig.clone();
            let user = f.user;
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    let intent = manager
                        .create_intent(user, BillingPlan::ProMonthly, Currency::Usdc)
                        .await
                        .unwrap();
                    manager.activate(intent.id, &sig).await
                } else {
                    manager
                        .activate_wallet(
                            &format!("Wa11et{}", i),
                            BillingPlan::ProMonthly,
                            &sig,
                            None,
                        )
                        .await
                }
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(PaymentError::ReplayDetected) => {}
                Err(other) => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_sweep_expires_stale_intents() {
        let f = fixture().await;
        let live = f
            .manager
            .create_intent(f.user, BillingPlan::ProMonthly, Currency::Sol)
            .await
            .unwrap();
        assert_eq!(live.amount, 50_000_000);

        let mut stale = live.clone();
        stale.id = Uuid::new_v4();
        stale.expires_at = Utc::now() - ChronoDuration::seconds(1);
        f.store.insert_intent(&stale).await.unwrap();

        assert_eq!(f.manager.sweep_expired().await.unwrap(), 1);
        assert_eq!(
            f.manager.get_intent(live.id).await.unwrap().unwrap().status,
            IntentStatus::Pending
        );
    }
}
