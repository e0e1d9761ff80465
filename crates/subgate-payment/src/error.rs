//! Payment error types

use thiserror::Error;

use crate::onchain::RejectReason;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid currency: {0}")]
    InvalidCurrency(String),

    #[error("Payment intent expired")]
    Expired,

    #[error("Payment intent already processed")]
    AlreadyProcessed,

    #[error("Verification failed: {0}")]
    VerificationFailed(RejectReason),

    #[error("Transaction signature already used")]
    ReplayDetected,

    #[error("Invalid webhook signature")]
    ProcessorSignatureInvalid,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Network error: {0}")]
    TransientNetworkError(String),

    #[error("Upstream API error: {0}")]
    ApiError(String),

    #[error("Subscription period must end in the future")]
    InvalidPeriod,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl PaymentError {
    /// Whether the caller may retry the same request unchanged
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::TransientNetworkError(_) => true,
            Self::VerificationFailed(reason) => reason.is_retriable(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for PaymentError {
    fn from(e: rusqlite::Error) -> Self {
        PaymentError::Storage(e.to_string())
    }
}

pub type PaymentResult<T> = Result<T, PaymentError>;
