//! On-chain payment verification
//!
//! Decides whether a transaction signature proves payment of an expected
//! amount into the treasury. Checks run cheapest first:
//!
//! 1. shape of the reference (local)
//! 2. lookup (the single RPC call)
//! 3. on-chain failure flag
//! 4. freshness of the block time
//! 5. transfer into the treasury for the requested asset
//! 6. amount, with a 1% downward tolerance
//! 7. memo, advisory only
//!
//! Destination and amount are the binding checks. A missing or mangled memo
//! is logged and accepted because wallets routinely drop memo instructions.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SolanaConfig;
use crate::error::PaymentResult;
use crate::model::Currency;
use crate::pricing::AmountPolicy;
use crate::solana::{is_plausible_signature, Asset, ChainRpc, ChainTransaction};

/// Why a transaction does not prove payment
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum RejectReason {
    #[error("transaction reference is malformed")]
    MalformedReference,

    #[error("transaction not found or still confirming")]
    NotFound,

    #[error("transaction has no block time yet")]
    NotFinalized,

    #[error("transaction failed on chain")]
    TransactionFailed,

    #[error("transaction is too old ({age_secs}s)")]
    Stale { age_secs: i64 },

    #[error("no transfer to the treasury in the requested currency")]
    NoMatchingTransfer,

    #[error("insufficient amount: expected {expected}, received {received} (short {})", shortfall(.expected, .received))]
    InsufficientAmount { expected: u64, received: u64 },
}

fn shortfall(expected: &u64, received: &u64) -> u64 {
    expected.saturating_sub(*received)
}

impl RejectReason {
    /// Whether resubmitting the same reference later may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::NotFound | Self::NotFinalized)
    }
}

/// A transfer that satisfied every binding check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTransfer {
    pub signature: String,
    /// Total atomic units received by the treasury
    pub amount: u64,
    pub block_time: i64,
    pub memo_matched: bool,
}

/// Verification outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid(VerifiedTransfer),
    Invalid(RejectReason),
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Where payments must land
#[derive(Debug, Clone)]
pub struct Treasury {
    /// Wallet receiving SOL and owning the USDC token account
    pub address: String,
    pub usdc_mint: String,
    /// Pinned USDC token account; otherwise any USDC account owned by `address`
    pub usdc_account: Option<String>,
}

impl Treasury {
    pub fn from_config(config: &SolanaConfig) -> Self {
        Self {
            address: config.treasury_address.clone(),
            usdc_mint: config.usdc_mint.clone(),
            usdc_account: config.treasury_usdc_account.clone(),
        }
    }

    /// Sum of atomic units of `currency` sent to the treasury by `tx`
    fn received(&self, tx: &ChainTransaction, currency: Currency) -> Option<u64> {
        let matching = tx.transfers.iter().filter(|t| match (currency, &t.asset) {
            (Currency::Sol, Asset::Sol) => t.destination == self.address,
            (Currency::Usdc, Asset::Token { mint }) => {
                let mint_ok = mint.as_deref() == Some(self.usdc_mint.as_str());
                let destination_ok = match &self.usdc_account {
                    Some(account) => &t.destination == account,
                    None => t.destination_owner.as_deref() == Some(self.address.as_str()),
                };
                mint_ok && destination_ok
            }
            _ => false,
        });

        matching.fold(None, |acc: Option<u64>, t| {
            Some(acc.unwrap_or(0).saturating_add(t.amount))
        })
    }
}

/// Verifies direct-transfer payments against the chain
pub struct OnChainVerifier {
    chain: Arc<dyn ChainRpc>,
    treasury: Treasury,
    max_age: Duration,
}

impl OnChainVerifier {
    pub fn new(chain: Arc<dyn ChainRpc>, treasury: Treasury, max_age: Duration) -> Self {
        Self {
            chain,
            treasury,
            max_age,
        }
    }

    pub fn from_config(chain: Arc<dyn ChainRpc>, config: &SolanaConfig) -> Self {
        Self::new(
            chain,
            Treasury::from_config(config),
            Duration::seconds(config.max_transaction_age_secs),
        )
    }

    pub fn treasury(&self) -> &Treasury {
        &self.treasury
    }

    /// Verify `reference` pays `expected_amount` of `currency`
    pub async fn verify(
        &self,
        reference: &str,
        currency: Currency,
        expected_amount: u64,
        expected_memo: &str,
    ) -> PaymentResult<Verification> {
        self.verify_at(reference, currency, expected_amount, expected_memo, Utc::now())
            .await
    }

    /// Same as [`verify`](Self::verify) with an explicit clock
    pub async fn verify_at(
        &self,
        reference: &str,
        currency: Currency,
        expected_amount: u64,
        expected_memo: &str,
        now: DateTime<Utc>,
    ) -> PaymentResult<Verification> {
        if !is_plausible_signature(reference) {
            return Ok(Verification::Invalid(RejectReason::MalformedReference));
        }

        let tx = match self.chain.get_transaction(reference).await? {
            Some(tx) => tx,
            None => {
                debug!("Transaction {} not found", reference);
                return Ok(Verification::Invalid(RejectReason::NotFound));
            }
        };

        Ok(self.evaluate(&tx, currency, expected_amount, expected_memo, now))
    }

    fn evaluate(
        &self,
        tx: &ChainTransaction,
        currency: Currency,
        expected_amount: u64,
        expected_memo: &str,
        now: DateTime<Utc>,
    ) -> Verification {
        if tx.failed {
            return Verification::Invalid(RejectReason::TransactionFailed);
        }

        let block_time = match tx.block_time {
            Some(t) => t,
            None => return Verification::Invalid(RejectReason::NotFinalized),
        };

        let age_secs = now.timestamp() - block_time;
        if age_secs > self.max_age.num_seconds() {
            return Verification::Invalid(RejectReason::Stale { age_secs });
        }

        let received = match self.treasury.received(tx, currency) {
            Some(amount) => amount,
            None => return Verification::Invalid(RejectReason::NoMatchingTransfer),
        };

        if !AmountPolicy::meets_tolerance(expected_amount, received) {
            return Verification::Invalid(RejectReason::InsufficientAmount {
                expected: expected_amount,
                received,
            });
        }

        let memo_matched = !expected_memo.is_empty()
            && tx.memos.iter().any(|memo| memo.contains(expected_memo));
        if !memo_matched {
            warn!(
                "Memo mismatch for {}: expected {:?}, found {:?} (accepted)",
                tx.signature, expected_memo, tx.memos
            );
        }

        info!(
            "Verified {} {} to treasury in {}",
            received, currency, tx.signature
        );

        Verification::Valid(VerifiedTransfer {
            signature: tx.signature.clone(),
            amount: received,
            block_time,
            memo_matched,
        })
    }
}
