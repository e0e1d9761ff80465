//! Price table and amount rules
//!
//! The single authority for what each plan costs in each currency. Every
//! other component asks this table; nothing else hard-codes an amount.

use chrono::{DateTime, Duration, Months, Utc};

use crate::config::{PlanPrices, PricingConfig};
use crate::error::{PaymentError, PaymentResult};
use crate::model::{BillingPlan, Currency};

/// Accepted fraction of the expected amount, as `NUMERATOR / DENOMINATOR`
pub const TOLERANCE_NUMERATOR: u128 = 99;
pub const TOLERANCE_DENOMINATOR: u128 = 100;

/// Plan prices in atomic units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountPolicy {
    monthly_usdc: u64,
    monthly_sol: u64,
    yearly_usdc: u64,
    yearly_sol: u64,
}

impl AmountPolicy {
    /// Build from configured decimal prices. Every price must be positive.
    pub fn from_config(config: &PricingConfig) -> PaymentResult<Self> {
        fn price(prices: &PlanPrices, currency: Currency, plan: &str) -> PaymentResult<u64> {
            let text = match currency {
                Currency::Usdc => &prices.usdc,
                Currency::Sol => &prices.sol,
            };
            match parse_amount(text, currency)? {
                0 => Err(PaymentError::Config(format!(
                    "pricing.{}.{} must be positive",
                    plan,
                    currency.as_str().to_lowercase()
                ))),
                atomic => Ok(atomic),
            }
        }

        Ok(Self {
            monthly_usdc: price(&config.pro_monthly, Currency::Usdc, "pro_monthly")?,
            monthly_sol: price(&config.pro_monthly, Currency::Sol, "pro_monthly")?,
            yearly_usdc: price(&config.pro_yearly, Currency::Usdc, "pro_yearly")?,
            yearly_sol: price(&config.pro_yearly, Currency::Sol, "pro_yearly")?,
        })
    }

    /// Price of `plan` in atomic units of `currency`
    pub fn price_for(&self, plan: BillingPlan, currency: Currency) -> u64 {
        match (plan, currency) {
            (BillingPlan::ProMonthly, Currency::Usdc) => self.monthly_usdc,
            (BillingPlan::ProMonthly, Currency::Sol) => self.monthly_sol,
            (BillingPlan::ProYearly, Currency::Usdc) => self.yearly_usdc,
            (BillingPlan::ProYearly, Currency::Sol) => self.yearly_sol,
        }
    }

    /// End of the period bought by `plan`, starting at `from`
    pub fn period_end(plan: BillingPlan, from: DateTime<Utc>) -> DateTime<Utc> {
        match plan {
            BillingPlan::ProMonthly => from
                .checked_add_months(Months::new(1))
                .unwrap_or(from + Duration::days(30)),
            BillingPlan::ProYearly => from
                .checked_add_months(Months::new(12))
                .unwrap_or(from + Duration::days(365)),
        }
    }

    /// `received >= expected * 0.99`, evaluated exactly
    pub fn meets_tolerance(expected: u64, received: u64) -> bool {
        received as u128 * TOLERANCE_DENOMINATOR >= expected as u128 * TOLERANCE_NUMERATOR
    }
}

/// Parse a decimal amount such as `"9.99"` into atomic units, exactly
pub fn parse_amount(text: &str, currency: Currency) -> PaymentResult<u64> {
    let invalid = || PaymentError::Config(format!("invalid {} amount {:?}", currency, text));

    let decimals = currency.decimals() as usize;
    let trimmed = text.trim();
    let (whole, frac) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());

    if (whole.is_empty() && frac.is_empty())
        || frac.len() > decimals
        || !digits(whole)
        || !digits(frac)
    {
        return Err(invalid());
    }

    let whole: u64 = match whole {
        "" => 0,
        w => w.parse().map_err(|_| invalid())?,
    };
    let frac: u64 = match frac {
        "" => 0,
        f => format!("{:0<width$}", f, width = decimals)
            .parse()
            .map_err(|_| invalid())?,
    };

    whole
        .checked_mul(10u64.pow(currency.decimals()))
        .and_then(|w| w.checked_add(frac))
        .ok_or_else(invalid)
}

/// Convert atomic units to whole units, for display only
pub fn to_decimal(atomic: u64, currency: Currency) -> f64 {
    atomic as f64 / 10u64.pow(currency.decimals()) as f64
}

/// Format atomic units for logs and messages
pub fn format_amount(atomic: u64, currency: Currency) -> String {
    let scale = 10u64.pow(currency.decimals());
    format!(
        "{}.{:0width$} {}",
        atomic / scale,
        atomic % scale,
        currency,
        width = currency.decimals() as usize
    )
}
