//! Payment memo tokens
//!
//! Memos correlate a transfer with an intent for support and audit. Wallets
//! frequently strip or rewrite memo fields, so a memo never authorizes
//! anything on its own.

use chrono::Utc;
use rand::RngCore;
use uuid::Uuid;

use crate::model::BillingPlan;

const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Length of the user prefix
const USER_PART_LEN: usize = 6;

/// Length of the random suffix
const RANDOM_PART_LEN: usize = 7;

/// Create a memo for a new intent
pub fn new_memo(user_id: &Uuid) -> String {
    let user_part: String = user_id
        .simple()
        .to_string()
        .chars()
        .take(USER_PART_LEN)
        .collect::<String>()
        .to_ascii_uppercase();

    let time_part = base36(Utc::now().timestamp().max(0) as u64, 0);

    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let random_part = base36(u32::from_be_bytes(bytes) as u64, RANDOM_PART_LEN);

    format!("{}{}{}", user_part, time_part, random_part)
}

/// Deterministic memo for a walk-up payment from `wallet`
pub fn walkup_memo(wallet: &str, plan: BillingPlan) -> String {
    let wallet_part: String = wallet
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_ascii_uppercase();

    let plan_code = match plan {
        BillingPlan::ProMonthly => 'M',
        BillingPlan::ProYearly => 'Y',
    };

    format!("SUB{}{}", wallet_part, plan_code)
}

/// Render `value` in uppercase base 36, left padded with zeros to `width`
fn base36(mut value: u64, width: usize) -> String {
    let mut digits = Vec::new();
    loop {
        digits.push(ALPHABET[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    while digits.len() < width {
        digits.push(b'0');
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}
