//! Wiring of both payment rails over one store

use std::sync::Arc;

use crate::config::SubgateConfig;
use crate::error::PaymentResult;
use crate::intent::PaymentIntentManager;
use crate::ledger::SubscriptionLedger;
use crate::onchain::OnChainVerifier;
use crate::pricing::AmountPolicy;
use crate::solana::ChainRpc;
use crate::store::Store;
use crate::stripe::{CheckoutApi, StripeBridge};

/// Both rails plus read access to the ledger
#[derive(Clone)]
pub struct Engine {
    pub intents: Arc<PaymentIntentManager>,
    pub stripe: Arc<StripeBridge>,
    pub ledger: SubscriptionLedger,
}

impl Engine {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        chain: Arc<dyn ChainRpc>,
        checkout: Arc<dyn CheckoutApi>,
        config: &SubgateConfig,
    ) -> PaymentResult<Self> {
        let verifier = OnChainVerifier::from_config(chain, &config.solana);
        let policy = AmountPolicy::from_config(&config.pricing)?;

        Ok(Self {
            intents: Arc::new(PaymentIntentManager::new(store.clone(), policy, verifier)),
            stripe: Arc::new(StripeBridge::new(store.clone(), checkout, &config.stripe)),
            ledger: SubscriptionLedger::new(store),
        })
    }
}
