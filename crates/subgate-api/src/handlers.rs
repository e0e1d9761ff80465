//! Request handlers

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use subgate_payment::pricing::to_decimal;
use subgate_payment::{
    Activation, BillingPlan, Currency, IntentStatus, PaymentError, PaymentIntent, PaymentMethod,
    Plan, Subscription, SubscriptionStatus,
};
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

type ApiResult<T> = Result<T, ApiError>;

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn parse_uuid(raw: &str, what: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::BadRequest(format!("invalid {}: {}", what, raw)))
}

fn required(value: &str, what: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{} is required", what)));
    }
    Ok(())
}

// =====================
// Intents
// =====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentRequest {
    pub user_id: String,
    pub plan: String,
    pub currency: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    pub payment_id: Uuid,
    pub treasury_address: String,
    /// Whole units, for display
    pub amount: f64,
    pub amount_atomic: u64,
    pub currency: Currency,
    pub memo: String,
    pub plan: BillingPlan,
    pub status: IntentStatus,
    pub expires_at: DateTime<Utc>,
}

impl IntentResponse {
    fn new(intent: PaymentIntent, treasury_address: &str) -> Self {
        Self {
            payment_id: intent.id,
            treasury_address: treasury_address.to_string(),
            amount: to_decimal(intent.amount, intent.currency),
            amount_atomic: intent.amount,
            currency: intent.currency,
            memo: intent.memo,
            plan: intent.plan,
            status: intent.status,
            expires_at: intent.expires_at,
        }
    }
}

pub async fn create_intent(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<IntentResponse>)> {
    let request: CreateIntentRequest = parse_body(&body)?;
    let user_id = parse_uuid(&request.user_id, "userId")?;
    let plan: BillingPlan = request.plan.parse()?;
    let currency: Currency = request.currency.parse()?;

    let manager = &state.engine.intents;
    let intent = manager.create_intent(user_id, plan, currency).await?;

    Ok((
        StatusCode::CREATED,
        Json(IntentResponse::new(intent, manager.treasury_address())),
    ))
}

pub async fn get_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<IntentResponse>> {
    let id = parse_uuid(&id, "payment id")?;
    let manager = &state.engine.intents;
    let intent = manager
        .get_intent(id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("payment intent {}", id)))?;

    Ok(Json(IntentResponse::new(intent, manager.treasury_address())))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub signature: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationResponse {
    pub success: bool,
    pub plan: Plan,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_processed: bool,
}

impl From<Activation> for ActivationResponse {
    fn from(activation: Activation) -> Self {
        Self {
            success: true,
            plan: activation.plan,
            expires_at: activation.expires_at,
            already_processed: false,
        }
    }
}

pub async fn verify_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ActivationResponse>> {
    let id = parse_uuid(&id, "payment id")?;
    let request: VerifyRequest = parse_body(&body)?;
    required(&request.signature, "signature")?;

    match state.engine.intents.activate(id, request.signature.trim()).await {
        Ok(activation) => Ok(Json(activation.into())),
        Err(PaymentError::AlreadyProcessed) => already_processed(&state, id).await,
        Err(e) => Err(e.into()),
    }
}

/// A settled intent answers with the current subscription instead of an error
async fn already_processed(state: &AppState, id: Uuid) -> ApiResult<Json<ActivationResponse>> {
    let intent = state
        .engine
        .intents
        .get_intent(id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("payment intent {}", id)))?;

    let subscription = state
        .engine
        .ledger
        .get(intent.user_id)
        .await?
        .ok_or(PaymentError::AlreadyProcessed)?;

    info!("Payment intent {} already processed", id);
    Ok(Json(ActivationResponse {
        success: true,
        plan: subscription.plan,
        expires_at: subscription.current_period_end,
        already_processed: true,
    }))
}

// =====================
// Subscriptions
// =====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletActivateRequest {
    pub wallet_address: String,
    pub plan: String,
    pub signature: String,
    pub currency: Option<String>,
}

pub async fn wallet_activate(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<ActivationResponse>> {
    let request: WalletActivateRequest = parse_body(&body)?;
    required(&request.wallet_address, "walletAddress")?;
    required(&request.signature, "signature")?;
    let plan: BillingPlan = request.plan.parse()?;
    let currency = request
        .currency
        .as_deref()
        .map(str::parse::<Currency>)
        .transpose()?;

    let activation = state
        .engine
        .intents
        .activate_wallet(&request.wallet_address, plan, request.signature.trim(), currency)
        .await?;

    Ok(Json(activation.into()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub user_id: Uuid,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub current_period_end: DateTime<Utc>,
    pub payment_method: PaymentMethod,
    pub last_payment_signature: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub entitled: bool,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(row: Subscription) -> Self {
        Self {
            entitled: row.is_entitled_at(Utc::now()),
            user_id: row.user_id,
            plan: row.plan,
            status: row.status,
            current_period_end: row.current_period_end,
            payment_method: row.payment_method,
            last_payment_signature: row.last_payment_signature,
            stripe_subscription_id: row.stripe_subscription_id,
        }
    }
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let user_id = parse_uuid(&user_id, "userId")?;
    let row = state
        .engine
        .ledger
        .get(user_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("subscription for {}", user_id)))?;

    Ok(Json(row.into()))
}

// =====================
// Hosted checkout
// =====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub plan: String,
    pub email: Option<String>,
    pub wallet_address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<CheckoutResponse>> {
    let request: CheckoutRequest = parse_body(&body)?;
    let plan: BillingPlan = request.plan.parse()?;

    let url = state
        .engine
        .stripe
        .create_checkout_session(plan, request.email.as_deref(), request.wallet_address.as_deref())
        .await?;

    Ok(Json(CheckoutResponse { url }))
}

/// Signature header names accepted on the webhook route
const SIGNATURE_HEADERS: [&str; 2] = ["stripe-signature", "signature"];

pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let header = SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
        .ok_or(PaymentError::ProcessorSignatureInvalid)?;

    let stripe = &state.engine.stripe;
    let event = stripe.verify_webhook(&body, header)?;
    let event_id = event.id.clone();
    let outcome = stripe.handle_event(event).await?;

    info!("Webhook {} handled: {}", event_id, outcome.as_str());
    Ok(Json(json!({ "received": true, "outcome": outcome.as_str() })))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
