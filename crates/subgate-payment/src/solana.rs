//! Solana JSON-RPC integration
//!
//! Looks up a single transaction by signature (`getTransaction` with
//! `jsonParsed` encoding) and normalises it into the transfers and memos the
//! verifier cares about. No indexing, no subscriptions, no wallet access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::SolanaConfig;
use crate::error::{PaymentError, PaymentResult};

/// Program names reported by `jsonParsed`
const PROGRAM_SYSTEM: &str = "system";
const PROGRAM_TOKEN: &str = "spl-token";
const PROGRAM_TOKEN_2022: &str = "spl-token-2022";
const PROGRAM_MEMO: &str = "spl-memo";

/// Asset moved by a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Asset {
    /// Native SOL (lamports)
    Sol,
    /// SPL token; mint is unknown when it cannot be resolved from balances
    Token { mint: Option<String> },
}

/// One value transfer found in a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub asset: Asset,
    pub source: String,
    /// Receiving account (a wallet for SOL, a token account for SPL)
    pub destination: String,
    /// Wallet owning the destination token account
    pub destination_owner: Option<String>,
    /// Atomic units
    pub amount: u64,
}

/// Normalised transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub signature: String,
    pub slot: u64,
    /// Unix seconds; absent while the block is not yet confirmed
    pub block_time: Option<i64>,
    /// Transaction executed but failed on chain
    pub failed: bool,
    pub transfers: Vec<TransferRecord>,
    pub memos: Vec<String>,
}

/// Single-transaction lookup against a chain node
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// `Ok(None)` when the node does not know the signature (yet)
    async fn get_transaction(&self, signature: &str) -> PaymentResult<Option<ChainTransaction>>;
}

/// Solana JSON-RPC client
pub struct SolanaRpc {
    /// HTTP client
    client: Client,
    /// RPC endpoint URL
    endpoint: String,
    /// Commitment level
    commitment: String,
}

impl SolanaRpc {
    /// Create a new RPC client
    pub fn new(endpoint: &str, commitment: &str, timeout: Duration) -> PaymentResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            commitment: commitment.to_string(),
        })
    }

    /// Create from configuration
    pub fn from_config(config: &SolanaConfig) -> PaymentResult<Self> {
        Self::new(
            &config.rpc_url,
            &config.commitment,
            Duration::from_secs(config.rpc_timeout_secs),
        )
    }

    /// Make a JSON-RPC call
    async fn rpc_call(&self, method: &str, params: Value) -> PaymentResult<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        debug!("Solana RPC call: {} -> {:?}", method, params);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| PaymentError::TransientNetworkError(format!("RPC request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(PaymentError::TransientNetworkError(format!(
                "RPC node returned status: {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(PaymentError::ApiError(format!("RPC node returned status: {}", status)));
        }

        let result: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::ApiError(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = result.error {
            return Err(PaymentError::ApiError(format!(
                "RPC error {}: {}",
                error.code, error.message
            )));
        }

        Ok(result.result.unwrap_or(Value::Null))
    }

    /// Current slot, used as a liveness check
    pub async fn get_slot(&self) -> PaymentResult<u64> {
        let result = self
            .rpc_call("getSlot", json!([{ "commitment": self.commitment }]))
            .await?;

        result
            .as_u64()
            .ok_or_else(|| PaymentError::ApiError("Invalid slot response".into()))
    }
}

#[async_trait]
impl ChainRpc for SolanaRpc {
    async fn get_transaction(&self, signature: &str) -> PaymentResult<Option<ChainTransaction>> {
        let result = self
            .rpc_call(
                "getTransaction",
                json!([
                    signature,
                    {
                        "encoding": "jsonParsed",
                        "commitment": self.commitment,
                        "maxSupportedTransactionVersion": 0
                    }
                ]),
            )
            .await?;

        if result.is_null() {
            return Ok(None);
        }

        parse_transaction(signature, &result).map(Some)
    }
}

/// Fixed set of transactions served from memory
#[derive(Default)]
pub struct InMemoryChain {
    transactions: DashMap<String, ChainTransaction>,
    lookups: AtomicUsize,
}

impl InMemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tx: ChainTransaction) {
        self.transactions.insert(tx.signature.clone(), tx);
    }

    /// Number of lookups served so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainRpc for InMemoryChain {
    async fn get_transaction(&self, signature: &str) -> PaymentResult<Option<ChainTransaction>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.transactions.get(signature).map(|tx| tx.value().clone()))
    }
}

// =====================
// Response parsing
// =====================

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Owner and mint of a token account, taken from the balance tables
#[derive(Debug, Clone)]
struct TokenAccountInfo {
    mint: Option<String>,
    owner: Option<String>,
}

/// Normalise a `getTransaction` (`jsonParsed`) result
pub fn parse_transaction(signature: &str, result: &Value) -> PaymentResult<ChainTransaction> {
    let meta = &result["meta"];
    let message = &result["transaction"]["message"];

    let account_keys = message["accountKeys"]
        .as_array()
        .ok_or_else(|| PaymentError::ApiError("Transaction has no account keys".into()))?
        .iter()
        .map(|key| match key {
            Value::String(s) => s.clone(),
            other => other["pubkey"].as_str().unwrap_or_default().to_string(),
        })
        .collect::<Vec<_>>();

    let token_accounts = token_account_index(meta, &account_keys);

    let mut instructions: Vec<&Value> = message["instructions"]
        .as_array()
        .map(|list| list.iter().collect())
        .unwrap_or_default();

    if let Some(inner) = meta["innerInstructions"].as_array() {
        for group in inner {
            if let Some(list) = group["instructions"].as_array() {
                instructions.extend(list.iter());
            }
        }
    }

    let mut transfers = Vec::new();
    let mut memos = Vec::new();

    for ix in instructions {
        match ix["program"].as_str() {
            Some(PROGRAM_SYSTEM) => {
                if let Some(transfer) = parse_system_transfer(&ix["parsed"]) {
                    transfers.push(transfer);
                }
            }
            Some(PROGRAM_TOKEN) | Some(PROGRAM_TOKEN_2022) => {
                if let Some(transfer) = parse_token_transfer(&ix["parsed"], &token_accounts) {
                    transfers.push(transfer);
                }
            }
            Some(PROGRAM_MEMO) => {
                if let Some(memo) = ix["parsed"].as_str() {
                    memos.push(memo.to_string());
                }
            }
            _ => {}
        }
    }

    if memos.is_empty() {
        memos.extend(memos_from_logs(meta));
    }

    Ok(ChainTransaction {
        signature: signature.to_string(),
        slot: result["slot"].as_u64().unwrap_or(0),
        block_time: result["blockTime"].as_i64(),
        failed: !meta["err"].is_null(),
        transfers,
        memos,
    })
}

fn token_account_index(meta: &Value, account_keys: &[String]) -> HashMap<String, TokenAccountInfo> {
    let mut index = HashMap::new();

    // post balances win over pre balances for accounts created in this tx
    for table in ["preTokenBalances", "postTokenBalances"] {
        let Some(balances) = meta[table].as_array() else {
            continue;
        };
        for balance in balances {
            let Some(account) = balance["accountIndex"]
                .as_u64()
                .and_then(|i| account_keys.get(i as usize))
            else {
                continue;
            };
            index.insert(
                account.clone(),
                TokenAccountInfo {
                    mint: balance["mint"].as_str().map(str::to_string),
                    owner: balance["owner"].as_str().map(str::to_string),
                },
            );
        }
    }

    index
}

fn parse_system_transfer(parsed: &Value) -> Option<TransferRecord> {
    if parsed["type"].as_str() != Some("transfer") {
        return None;
    }
    let info = &parsed["info"];

    Some(TransferRecord {
        asset: Asset::Sol,
        source: info["source"].as_str()?.to_string(),
        destination: info["destination"].as_str()?.to_string(),
        destination_owner: None,
        amount: info["lamports"].as_u64()?,
    })
}

fn parse_token_transfer(
    parsed: &Value,
    token_accounts: &HashMap<String, TokenAccountInfo>,
) -> Option<TransferRecord> {
    let info = &parsed["info"];
    let amount = match parsed["type"].as_str()? {
        "transfer" => info["amount"].as_str()?.parse::<u64>().ok()?,
        "transferChecked" => info["tokenAmount"]["amount"].as_str()?.parse::<u64>().ok()?,
        _ => return None,
    };

    let destination = info["destination"].as_str()?.to_string();
    let account = token_accounts.get(&destination);
    let mint = info["mint"]
        .as_str()
        .map(str::to_string)
        .or_else(|| account.and_then(|a| a.mint.clone()));

    Some(TransferRecord {
        asset: Asset::Token { mint },
        source: info["source"].as_str().unwrap_or_default().to_string(),
        destination_owner: account.and_then(|a| a.owner.clone()),
        destination,
        amount,
    })
}

/// Memo program logs look like `Program log: Memo (len 12): "ABC123"`
fn memos_from_logs(meta: &Value) -> Vec<String> {
    meta["logMessages"]
        .as_array()
        .map(|logs| {
            logs.iter()
                .filter_map(Value::as_str)
                .filter_map(|line| {
                    let rest = line.strip_prefix("Program log: Memo (len ")?;
                    let (_, memo) = rest.split_once("): ")?;
                    Some(memo.trim_matches('"').to_string())
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Cheap shape check for a base58 transaction signature
pub fn is_plausible_signature(signature: &str) -> bool {
    (43..=90).contains(&signature.len()) && signature.chars().all(|c| c.is_ascii_alphanumeric())
}
