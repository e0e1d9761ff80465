//! Records owned by the engine: intents, subscriptions, profiles

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PaymentError;

/// Billing plan a payer can buy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPlan {
    ProMonthly,
    ProYearly,
}

impl BillingPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProMonthly => "pro_monthly",
            Self::ProYearly => "pro_yearly",
        }
    }

    /// Entitlement granted once paid
    pub fn tier(&self) -> Plan {
        Plan::Pro
    }
}

impl FromStr for BillingPlan {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pro_monthly" | "monthly" => Ok(Self::ProMonthly),
            "pro_yearly" | "yearly" => Ok(Self::ProYearly),
            other => Err(PaymentError::InvalidPlan(other.to_string())),
        }
    }
}

impl fmt::Display for BillingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entitlement level stored on a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Pro,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }
}

impl FromStr for Plan {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            other => Err(PaymentError::InvalidPlan(other.to_string())),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crypto asset accepted on the direct-transfer rail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "USDC")]
    Usdc,
    #[serde(rename = "SOL")]
    Sol,
}

impl Currency {
    /// Decimal places of the atomic unit (micro-USDC, lamports)
    pub fn decimals(&self) -> u32 {
        match self {
            Self::Usdc => 6,
            Self::Sol => 9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usdc => "USDC",
            Self::Sol => "SOL",
        }
    }
}

impl FromStr for Currency {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USDC" => Ok(Self::Usdc),
            "SOL" => Ok(Self::Sol),
            other => Err(PaymentError::InvalidCurrency(other.to_string())),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment intent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Waiting for a transaction
    Pending,
    /// Verified and activated
    Completed,
    /// Window closed before a valid transaction arrived
    Expired,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for IntentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            other => Err(PaymentError::Storage(format!("unknown intent status: {}", other))),
        }
    }
}

/// A server-recorded promise to pay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan: BillingPlan,
    /// Expected amount in atomic units of `currency`
    pub amount: u64,
    pub currency: Currency,
    pub memo: String,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub transaction_signature: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentIntent {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Subscription status vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::PastDue => "past_due",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "canceled" => Ok(Self::Canceled),
            "past_due" => Ok(Self::PastDue),
            other => Err(PaymentError::Storage(format!("unknown subscription status: {}", other))),
        }
    }
}

/// Rail that produced the last activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Crypto,
    Stripe,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crypto => "crypto",
            Self::Stripe => "stripe",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crypto" => Ok(Self::Crypto),
            "stripe" => Ok(Self::Stripe),
            other => Err(PaymentError::Storage(format!("unknown payment method: {}", other))),
        }
    }
}

/// Rail-specific correlation attached to an activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Correlation {
    /// On-chain transaction signature
    Transaction(String),
    /// Processor ids from a hosted checkout
    Stripe {
        customer_id: Option<String>,
        subscription_id: Option<String>,
    },
}

impl Correlation {
    pub fn method(&self) -> PaymentMethod {
        match self {
            Self::Transaction(_) => PaymentMethod::Crypto,
            Self::Stripe { .. } => PaymentMethod::Stripe,
        }
    }
}

/// Authoritative entitlement record, one per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: Uuid,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub current_period_end: DateTime<Utc>,
    pub payment_method: PaymentMethod,
    pub last_payment_signature: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
}

impl Subscription {
    /// Whether the user currently holds a paid entitlement
    pub fn is_entitled_at(&self, now: DateTime<Utc>) -> bool {
        self.plan == Plan::Pro
            && self.status != SubscriptionStatus::Canceled
            && self.current_period_end > now
    }
}

/// User identity anchor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub wallet_address: Option<String>,
    pub email: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn for_wallet(wallet: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_address: Some(wallet.to_string()),
            email: None,
            stripe_customer_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_email(email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_address: None,
            email: Some(email.to_string()),
            stripe_customer_id: None,
            created_at: Utc::now(),
        }
    }
}
