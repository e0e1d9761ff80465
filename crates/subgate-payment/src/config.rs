//! Engine configuration
//!
//! Everything the verification path depends on (treasury, RPC endpoint,
//! webhook secret, price table) is supplied here at startup and injected into
//! each component. Nothing inside the engine reads ambient global state.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, PaymentResult};
use crate::pricing::AmountPolicy;

/// Mainnet USDC mint
pub const USDC_MINT_MAINNET: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

/// Upper bound for any outbound call made while serving a request
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgateConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Solana RPC and treasury configuration
    pub solana: SolanaConfig,
    /// Card processor configuration
    pub stripe: StripeConfig,
    /// Price table
    pub pricing: PricingConfig,
    /// Persistence backend
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Request timeout (seconds)
    pub request_timeout_secs: u64,
}

/// Solana configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolanaConfig {
    /// JSON-RPC endpoint
    pub rpc_url: String,
    /// Commitment level for lookups (confirmed, finalized)
    pub commitment: String,
    /// Treasury wallet receiving all payments
    pub treasury_address: String,
    /// USDC mint address
    pub usdc_mint: String,
    /// Treasury USDC token account, if pinned explicitly
    pub treasury_usdc_account: Option<String>,
    /// Maximum transaction age accepted as proof (seconds)
    pub max_transaction_age_secs: i64,
    /// RPC request timeout (seconds)
    pub rpc_timeout_secs: u64,
}

/// Stripe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeConfig {
    /// Secret API key
    pub secret_key: String,
    /// Webhook signing secret
    pub webhook_secret: String,
    /// API base URL
    pub api_base: String,
    /// Processor price id per plan
    pub price_ids: StripePriceIds,
    /// Redirect after a successful checkout
    pub success_url: String,
    /// Redirect after an abandoned checkout
    pub cancel_url: String,
    /// Maximum webhook signature age (seconds)
    pub signature_tolerance_secs: i64,
    /// API request timeout (seconds)
    pub timeout_secs: u64,
}

/// Processor price ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripePriceIds {
    pub pro_monthly: String,
    pub pro_yearly: String,
}

/// Price table as decimal strings in whole currency units, e.g. `"9.99"`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub pro_monthly: PlanPrices,
    pub pro_yearly: PlanPrices,
}

/// Prices for one plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPrices {
    pub usdc: String,
    pub sol: String,
}

/// Storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend kind
    pub backend: StorageBackend,
    /// Database path (sqlite only)
    pub path: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for SubgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen: "0.0.0.0:8080".to_string(),
                request_timeout_secs: MAX_REQUEST_TIMEOUT_SECS,
            },
            solana: SolanaConfig {
                rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
                commitment: "confirmed".to_string(),
                treasury_address: String::new(),
                usdc_mint: USDC_MINT_MAINNET.to_string(),
                treasury_usdc_account: None,
                max_transaction_age_secs: 3600,
                rpc_timeout_secs: 10,
            },
            stripe: StripeConfig {
                secret_key: String::new(),
                webhook_secret: String::new(),
                api_base: "https://api.stripe.com".to_string(),
                price_ids: StripePriceIds {
                    pro_monthly: String::new(),
                    pro_yearly: String::new(),
                },
                success_url: "http://localhost:3000/billing/success".to_string(),
                cancel_url: "http://localhost:3000/billing/cancel".to_string(),
                signature_tolerance_secs: 300,
                timeout_secs: 10,
            },
            pricing: PricingConfig {
                pro_monthly: PlanPrices {
                    usdc: "9.99".to_string(),
                    sol: "0.05".to_string(),
                },
                pro_yearly: PlanPrices {
                    usdc: "99.99".to_string(),
                    sol: "0.5".to_string(),
                },
            },
            storage: StorageConfig {
                backend: StorageBackend::Sqlite,
                path: "subgate.db".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

impl SubgateConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> PaymentResult<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PaymentError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(contents: &str) -> PaymentResult<Self> {
        toml::from_str(contents).map_err(|e| PaymentError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> PaymentResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PaymentError::Config(e.to_string()))?;
            }
        }

        let contents = self.to_toml()?;
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| PaymentError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> PaymentResult<String> {
        toml::to_string_pretty(self).map_err(|e| PaymentError::Config(e.to_string()))
    }

    /// Override secrets and endpoints from the environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SUBGATE_STRIPE_SECRET_KEY") {
            self.stripe.secret_key = v;
        }
        if let Some(v) = lookup("SUBGATE_STRIPE_WEBHOOK_SECRET") {
            self.stripe.webhook_secret = v;
        }
        if let Some(v) = lookup("SUBGATE_SOLANA_RPC_URL") {
            self.solana.rpc_url = v;
        }
        if let Some(v) = lookup("SUBGATE_TREASURY_ADDRESS") {
            self.solana.treasury_address = v;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> PaymentResult<()> {
        if self.solana.treasury_address.trim().is_empty() {
            return Err(PaymentError::Config("solana.treasury_address is required".into()));
        }

        if self.solana.rpc_url.trim().is_empty() {
            return Err(PaymentError::Config("solana.rpc_url is required".into()));
        }

        if self.solana.max_transaction_age_secs <= 0 {
            return Err(PaymentError::Config(
                "solana.max_transaction_age_secs must be positive".into(),
            ));
        }

        for (name, secs) in [
            ("server.request_timeout_secs", self.server.request_timeout_secs),
            ("solana.rpc_timeout_secs", self.solana.rpc_timeout_secs),
            ("stripe.timeout_secs", self.stripe.timeout_secs),
        ] {
            if secs == 0 || secs > MAX_REQUEST_TIMEOUT_SECS {
                return Err(PaymentError::Config(format!(
                    "{} must be between 1 and {}",
                    name, MAX_REQUEST_TIMEOUT_SECS
                )));
            }
        }

        AmountPolicy::from_config(&self.pricing)?;

        Ok(())
    }
}
