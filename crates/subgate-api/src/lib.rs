//! Subgate HTTP API
//!
//! JSON endpoints over the payment engine:
//! - `POST /payments/intents`, `GET /payments/intents/:id`
//! - `PUT /payments/intents/:id/verify`
//! - `POST /subscriptions/wallet-activate`, `GET /subscriptions/:user_id`
//! - `POST /checkout/sessions`
//! - `POST /webhooks/payment-processor`
//! - `GET /health`

use std::time::Duration;

use axum::routing::{get, post, put};
use axum::Router;
use subgate_payment::Engine;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub mod error;
pub mod handlers;

pub use error::ApiError;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

/// Build the router. `request_timeout` bounds every request, including the
/// one outbound call it may make.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/payments/intents", post(handlers::create_intent))
        .route("/payments/intents/:id", get(handlers::get_intent))
        .route("/payments/intents/:id/verify", put(handlers::verify_intent))
        .route("/subscriptions/wallet-activate", post(handlers::wallet_activate))
        .route("/subscriptions/:user_id", get(handlers::get_subscription))
        .route("/checkout/sessions", post(handlers::create_checkout))
        .route("/webhooks/payment-processor", post(handlers::payment_webhook))
        .route("/health", get(handlers::health))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
