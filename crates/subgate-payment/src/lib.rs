//! Subgate payment engine
//!
//! Turns a payment into subscription state. Two rails converge on one
//! subscription record per user:
//! 1. Direct transfer: the payer sends USDC or SOL to the treasury and proves
//!    it with the transaction signature, either against a pre-registered
//!    intent or walk-up from a wallet
//! 2. Hosted checkout: Stripe collects the card payment and reports back via
//!    signed webhooks
//!
//! A transaction signature activates at most one subscription, system-wide.

pub mod config;
pub mod engine;
pub mod error;
pub mod intent;
pub mod ledger;
pub mod memo;
pub mod model;
pub mod onchain;
pub mod pricing;
pub mod replay;
pub mod solana;
pub mod store;
pub mod stripe;

pub use config::SubgateConfig;
pub use engine::Engine;
pub use error::{PaymentError, PaymentResult};
pub use intent::{Activation, PaymentIntentManager};
pub use ledger::SubscriptionLedger;
pub use model::{
    BillingPlan, Correlation, Currency, IntentStatus, PaymentIntent, PaymentMethod, Plan, Profile,
    Subscription, SubscriptionStatus,
};
pub use onchain::{OnChainVerifier, RejectReason, Verification};
pub use pricing::AmountPolicy;
pub use replay::ReplayGuard;
pub use solana::{ChainRpc, InMemoryChain, SolanaRpc};
pub use store::{MemoryStore, SqliteStore, Store};
pub use stripe::{CheckoutApi, StripeBridge, StripeClient, WebhookOutcome};

/// Lifetime of a pending intent
pub const INTENT_TTL_MINUTES: i64 = 30;

/// Period granted by a completed hosted checkout
pub const CHECKOUT_PERIOD_DAYS: i64 = 30;
