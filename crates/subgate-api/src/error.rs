//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use subgate_payment::PaymentError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: &'static str,
    retriable: bool,
}

impl ApiError {
    /// Returns the HTTP status code for this error.
    ///
    /// - Bad input, failed webhook signature: 400
    /// - Unknown intent, user or subscription: 404
    /// - Signature already used, intent settled concurrently: 409
    /// - Intent past its window: 410
    /// - Transaction does not prove the payment: 422
    /// - Processor rejected our call: 502
    /// - RPC or processor unreachable: 503
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Payment(e) => match e {
                PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
                PaymentError::InvalidPlan(_)
                | PaymentError::InvalidCurrency(_)
                | PaymentError::InvalidPayload(_)
                | PaymentError::InvalidPeriod
                | PaymentError::ProcessorSignatureInvalid => StatusCode::BAD_REQUEST,
                PaymentError::Expired => StatusCode::GONE,
                PaymentError::AlreadyProcessed | PaymentError::ReplayDetected => {
                    StatusCode::CONFLICT
                }
                PaymentError::VerificationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
                PaymentError::TransientNetworkError(_) => StatusCode::SERVICE_UNAVAILABLE,
                PaymentError::ApiError(_) => StatusCode::BAD_GATEWAY,
                PaymentError::Storage(_) | PaymentError::Config(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Payment(e) => match e {
                PaymentError::NotFound(_) => "NOT_FOUND",
                PaymentError::InvalidPlan(_) => "INVALID_PLAN",
                PaymentError::InvalidCurrency(_) => "INVALID_CURRENCY",
                PaymentError::Expired => "EXPIRED",
                PaymentError::AlreadyProcessed => "ALREADY_PROCESSED",
                PaymentError::VerificationFailed(_) => "VERIFICATION_FAILED",
                PaymentError::ReplayDetected => "REPLAY_DETECTED",
                PaymentError::ProcessorSignatureInvalid => "INVALID_SIGNATURE",
                PaymentError::InvalidPayload(_) => "INVALID_PAYLOAD",
                PaymentError::TransientNetworkError(_) => "NETWORK_ERROR",
                PaymentError::ApiError(_) => "UPSTREAM_ERROR",
                PaymentError::InvalidPeriod => "INVALID_PERIOD",
                PaymentError::Storage(_) | PaymentError::Config(_) => "INTERNAL",
            },
        }
    }

    fn retriable(&self) -> bool {
        match self {
            Self::Payment(e) => e.is_retriable(),
            Self::BadRequest(_) => false,
        }
    }

    /// Message safe to return to clients
    fn public_message(&self) -> String {
        match self {
            Self::Payment(PaymentError::Storage(_) | PaymentError::Config(_)) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = ErrorBody {
            success: false,
            error: self.public_message(),
            code: self.code(),
            retriable: self.retriable(),
        };

        (status, Json(body)).into_response()
    }
}
