//! Stripe hosted checkout and webhooks
//!
//! Card payments never touch this service. We create a hosted checkout
//! session, then learn about the outcome from signed webhook events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{StripeConfig, StripePriceIds};
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::SubscriptionLedger;
use crate::model::{BillingPlan, Correlation, Plan, Profile, SubscriptionStatus};
use crate::replay::ReplayGuard;
use crate::store::{ProfileStore, Store};
use crate::CHECKOUT_PERIOD_DAYS;

type HmacSha256 = Hmac<Sha256>;

// =====================
// Checkout API
// =====================

/// Parameters for a hosted checkout session
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub plan: BillingPlan,
    pub price_id: String,
    pub customer_email: Option<String>,
    pub client_reference_id: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

/// Hosted checkout provider
#[async_trait]
pub trait CheckoutApi: Send + Sync {
    async fn create_session(&self, request: &CheckoutRequest) -> PaymentResult<CheckoutSession>;
}

/// Stripe REST client
pub struct StripeClient {
    client: Client,
    api_base: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

impl StripeClient {
    pub fn new(api_base: &str, secret_key: &str, timeout: Duration) -> PaymentResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    pub fn from_config(config: &StripeConfig) -> PaymentResult<Self> {
        Self::new(
            &config.api_base,
            &config.secret_key,
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl CheckoutApi for StripeClient {
    async fn create_session(&self, request: &CheckoutRequest) -> PaymentResult<CheckoutSession> {
        let mut form: Vec<(&str, String)> = vec![
            ("mode", "subscription".to_string()),
            ("line_items[0][price]", request.price_id.clone()),
            ("line_items[0][quantity]", "1".to_string()),
            ("success_url", request.success_url.clone()),
            ("cancel_url", request.cancel_url.clone()),
            ("metadata[plan]", request.plan.as_str().to_string()),
        ];
        if let Some(email) = &request.customer_email {
            form.push(("customer_email", email.clone()));
        }
        if let Some(reference) = &request.client_reference_id {
            form.push(("client_reference_id", reference.clone()));
        }

        debug!("Creating checkout session for {}", request.plan);

        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| PaymentError::TransientNetworkError(format!("Stripe: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(PaymentError::TransientNetworkError(format!("Stripe returned {}", status)));
        }
        if !status.is_success() {
            let message = response
                .json::<StripeErrorBody>()
                .await
                .ok()
                .and_then(|body| body.error.message)
                .unwrap_or_else(|| status.to_string());
            return Err(PaymentError::ApiError(format!("Stripe: {}", message)));
        }

        response
            .json::<CheckoutSession>()
            .await
            .map_err(|e| PaymentError::ApiError(format!("Stripe response: {}", e)))
    }
}

// =====================
// Webhook signatures
// =====================

fn signed_mac(secret: &str, timestamp: i64, payload: &[u8]) -> PaymentResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PaymentError::Config(format!("webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Hex `v1` signature of `payload` at `timestamp`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> PaymentResult<String> {
    Ok(hex::encode(signed_mac(secret, timestamp, payload)?.finalize().into_bytes()))
}

/// Parsed `Stripe-Signature` header
#[derive(Debug, PartialEq)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_signature_header(header: &str) -> Option<SignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = match part.trim().split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    if signatures.is_empty() {
        return None;
    }
    timestamp.map(|timestamp| SignatureHeader {
        timestamp,
        signatures,
    })
}

// =====================
// Events
// =====================

/// Webhook events the engine understands
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    CheckoutCompleted {
        customer_id: Option<String>,
        subscription_id: Option<String>,
        email: Option<String>,
        client_reference_id: Option<String>,
        plan: Option<BillingPlan>,
    },
    SubscriptionDeleted {
        customer_id: String,
        subscription_id: Option<String>,
    },
    SubscriptionUpdated {
        customer_id: String,
        subscription_id: Option<String>,
        status: String,
        current_period_end: Option<DateTime<Utc>>,
    },
    /// Acknowledged and ignored
    Unhandled(String),
}

/// Authenticated webhook event
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub event: ProcessorEvent,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

fn str_field(object: &Value, key: &str) -> Option<String> {
    object[key].as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

fn required_customer(object: &Value, event_type: &str) -> PaymentResult<String> {
    str_field(object, "customer")
        .ok_or_else(|| PaymentError::InvalidPayload(format!("{} without customer", event_type)))
}

impl ProcessorEvent {
    fn from_raw(event_type: &str, object: &Value) -> PaymentResult<Self> {
        let event = match event_type {
            "checkout.session.completed" => Self::CheckoutCompleted {
                customer_id: str_field(object, "customer"),
                subscription_id: str_field(object, "subscription"),
                email: str_field(object, "customer_email")
                    .or_else(|| str_field(&object["customer_details"], "email")),
                client_reference_id: str_field(object, "client_reference_id"),
                plan: str_field(&object["metadata"], "plan").and_then(|p| p.parse().ok()),
            },
            "customer.subscription.deleted" => Self::SubscriptionDeleted {
                customer_id: required_customer(object, event_type)?,
                subscription_id: str_field(object, "id"),
            },
            "customer.subscription.updated" => {
                // Newer API versions moved the period onto the subscription items
                let period_end = object["current_period_end"]
                    .as_i64()
                    .or_else(|| object["items"]["data"][0]["current_period_end"].as_i64())
                    .and_then(|secs| DateTime::from_timestamp(secs, 0));

                Self::SubscriptionUpdated {
                    customer_id: required_customer(object, event_type)?,
                    subscription_id: str_field(object, "id"),
                    status: str_field(object, "status").unwrap_or_default(),
                    current_period_end: period_end,
                }
            }
            other => Self::Unhandled(other.to_string()),
        };
        Ok(event)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::CheckoutCompleted { .. } => "checkout.session.completed",
            Self::SubscriptionDeleted { .. } => "customer.subscription.deleted",
            Self::SubscriptionUpdated { .. } => "customer.subscription.updated",
            Self::Unhandled(name) => name,
        }
    }
}

/// Map a processor subscription status onto ours. The flag marks terminal
/// states that also drop the plan.
pub fn map_processor_status(status: &str) -> (SubscriptionStatus, bool) {
    match status {
        "active" | "trialing" => (SubscriptionStatus::Active, false),
        "past_due" => (SubscriptionStatus::PastDue, false),
        "canceled" | "unpaid" | "incomplete_expired" => (SubscriptionStatus::Canceled, true),
        _ => (SubscriptionStatus::Active, false),
    }
}

/// What handling an event did
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Activated {
        user_id: Uuid,
        period_end: DateTime<Utc>,
    },
    Downgraded {
        user_id: Uuid,
    },
    StatusUpdated {
        user_id: Uuid,
        status: SubscriptionStatus,
    },
    /// Event id seen before
    Duplicate,
    Ignored(String),
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activated { .. } => "activated",
            Self::Downgraded { .. } => "downgraded",
            Self::StatusUpdated { .. } => "status_updated",
            Self::Duplicate => "duplicate",
            Self::Ignored(_) => "ignored",
        }
    }
}

// =====================
// Bridge
// =====================

/// Hosted checkout rail
pub struct StripeBridge {
    api: Arc<dyn CheckoutApi>,
    profiles: Arc<dyn ProfileStore>,
    events: ReplayGuard,
    ledger: SubscriptionLedger,
    webhook_secret: String,
    tolerance_secs: i64,
    price_ids: StripePriceIds,
    success_url: String,
    cancel_url: String,
}

impl StripeBridge {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        api: Arc<dyn CheckoutApi>,
        config: &StripeConfig,
    ) -> Self {
        Self {
            api,
            profiles: store.clone(),
            events: ReplayGuard::new(store.clone()),
            ledger: SubscriptionLedger::new(store),
            webhook_secret: config.webhook_secret.clone(),
            tolerance_secs: config.signature_tolerance_secs,
            price_ids: config.price_ids.clone(),
            success_url: config.success_url.clone(),
            cancel_url: config.cancel_url.clone(),
        }
    }

    /// Start a hosted checkout and return its URL
    pub async fn create_checkout_session(
        &self,
        plan: BillingPlan,
        customer_email: Option<&str>,
        client_reference_id: Option<&str>,
    ) -> PaymentResult<String> {
        let price_id = match plan {
            BillingPlan::ProMonthly => &self.price_ids.pro_monthly,
            BillingPlan::ProYearly => &self.price_ids.pro_yearly,
        };
        if price_id.is_empty() {
            return Err(PaymentError::Config(format!("no Stripe price configured for {}", plan)));
        }

        let request = CheckoutRequest {
            plan,
            price_id: price_id.clone(),
            customer_email: customer_email.map(str::to_string),
            client_reference_id: client_reference_id.map(str::to_string),
            success_url: self.success_url.clone(),
            cancel_url: self.cancel_url.clone(),
        };

        let session = self.api.create_session(&request).await?;
        info!("Checkout session {} created for {}", session.id, plan);

        session
            .url
            .ok_or_else(|| PaymentError::ApiError(format!("session {} has no url", session.id)))
    }

    /// Authenticate and parse a webhook delivery
    pub fn verify_webhook(&self, payload: &[u8], header: &str) -> PaymentResult<WebhookEvent> {
        self.verify_webhook_at(payload, header, Utc::now().timestamp())
    }

    pub fn verify_webhook_at(
        &self,
        payload: &[u8],
        header: &str,
        now: i64,
    ) -> PaymentResult<WebhookEvent> {
        if self.webhook_secret.is_empty() {
            error!("Webhook received but no webhook secret is configured");
            return Err(PaymentError::ProcessorSignatureInvalid);
        }

        let header = parse_signature_header(header).ok_or_else(|| {
            warn!("Rejected webhook: malformed signature header");
            PaymentError::ProcessorSignatureInvalid
        })?;

        let age = now.checked_sub(header.timestamp).ok_or_else(|| {
            warn!("Rejected webhook: signature timestamp {} out of range", header.timestamp);
            PaymentError::ProcessorSignatureInvalid
        })?;
        if age > self.tolerance_secs {
            warn!(
                "Rejected webhook: signature timestamp {} is {}s old",
                header.timestamp, age
            );
            return Err(PaymentError::ProcessorSignatureInvalid);
        }

        let mac = signed_mac(&self.webhook_secret, header.timestamp, payload)?;
        let matched = header
            .signatures
            .iter()
            .any(|candidate| mac.clone().verify_slice(candidate).is_ok());
        if !matched {
            warn!("Rejected webhook: signature mismatch");
            return Err(PaymentError::ProcessorSignatureInvalid);
        }

        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::InvalidPayload(format!("webhook body: {}", e)))?;
        let event = ProcessorEvent::from_raw(&raw.event_type, &raw.data.object)?;

        debug!("Webhook {} verified ({})", raw.id, raw.event_type);
        Ok(WebhookEvent { id: raw.id, event })
    }

    /// Apply a verified event to the ledger. The event id is claimed before
    /// handling and released if handling fails.
    pub async fn handle_event(&self, webhook: WebhookEvent) -> PaymentResult<WebhookOutcome> {
        let event_key = format!("stripe-event:{}", webhook.id);
        if !self.events.claim(&event_key, "stripe-webhook").await? {
            info!("Webhook {} already handled", webhook.id);
            return Ok(WebhookOutcome::Duplicate);
        }

        match self.dispatch(webhook.event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("Webhook {} failed, releasing for retry: {}", webhook.id, e);
                if let Err(release) = self.events.release(&event_key).await {
                    error!("Failed to release webhook {}: {}", webhook.id, release);
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event: ProcessorEvent) -> PaymentResult<WebhookOutcome> {
        match event {
            ProcessorEvent::CheckoutCompleted {
                customer_id,
                subscription_id,
                email,
                client_reference_id,
                plan,
            } => {
                self.checkout_completed(
                    customer_id,
                    subscription_id,
                    email,
                    client_reference_id,
                    plan,
                )
                .await
            }
            ProcessorEvent::SubscriptionDeleted { customer_id, .. } => {
                self.subscription_deleted(&customer_id).await
            }
            ProcessorEvent::SubscriptionUpdated {
                customer_id,
                status,
                current_period_end,
                ..
            } => {
                self.subscription_updated(&customer_id, &status, current_period_end)
                    .await
            }
            ProcessorEvent::Unhandled(name) => {
                debug!("Ignoring webhook event type {}", name);
                Ok(WebhookOutcome::Ignored(format!("unhandled event type {}", name)))
            }
        }
    }

    async fn checkout_completed(
        &self,
        customer_id: Option<String>,
        subscription_id: Option<String>,
        email: Option<String>,
        client_reference_id: Option<String>,
        plan: Option<BillingPlan>,
    ) -> PaymentResult<WebhookOutcome> {
        let profile = match self
            .resolve_payer(client_reference_id.as_deref(), email.as_deref(), customer_id.as_deref())
            .await?
        {
            Some(profile) => profile,
            None => {
                warn!("Checkout completed without any payer identity");
                return Ok(WebhookOutcome::Ignored("no payer identity".into()));
            }
        };

        if let Some(customer) = &customer_id {
            self.profiles
                .link_customer(profile.id, customer, email.as_deref())
                .await?;
        }

        let period_end = Utc::now() + chrono::Duration::days(CHECKOUT_PERIOD_DAYS);
        let row = self
            .ledger
            .upsert_active(
                profile.id,
                Plan::Pro,
                period_end,
                Correlation::Stripe {
                    customer_id,
                    subscription_id,
                },
            )
            .await?;

        info!(
            "Checkout completed for {} ({})",
            profile.id,
            plan.map(|p| p.as_str()).unwrap_or("plan unknown")
        );

        Ok(WebhookOutcome::Activated {
            user_id: row.user_id,
            period_end: row.current_period_end,
        })
    }

    /// Wallet or user id from `client_reference_id`, then email, then
    /// customer id; a minimal profile is created when nothing matches.
    async fn resolve_payer(
        &self,
        client_reference_id: Option<&str>,
        email: Option<&str>,
        customer_id: Option<&str>,
    ) -> PaymentResult<Option<Profile>> {
        if let Some(reference) = client_reference_id {
            if let Ok(id) = Uuid::parse_str(reference) {
                if let Some(profile) = self.profiles.get_profile(id).await? {
                    return Ok(Some(profile));
                }
            }
            if let Some(profile) = self.profiles.find_by_wallet(reference).await? {
                return Ok(Some(profile));
            }
        }

        if let Some(email) = email {
            if let Some(profile) = self.profiles.find_by_email(email).await? {
                return Ok(Some(profile));
            }
        }

        if let Some(customer) = customer_id {
            if let Some(profile) = self.profiles.find_by_customer(customer).await? {
                return Ok(Some(profile));
            }
        }

        match (client_reference_id, email) {
            (Some(wallet), _) if Uuid::parse_str(wallet).is_err() => self
                .profiles
                .get_or_create_wallet_profile(wallet)
                .await
                .map(Some),
            (_, Some(email)) => self
                .profiles
                .get_or_create_email_profile(email)
                .await
                .map(Some),
            _ => Ok(None),
        }
    }

    async fn subscription_deleted(&self, customer_id: &str) -> PaymentResult<WebhookOutcome> {
        let profile = match self.profiles.find_by_customer(customer_id).await? {
            Some(profile) => profile,
            None => {
                warn!("Subscription deleted for unknown customer {}", customer_id);
                return Ok(WebhookOutcome::Ignored(format!("unknown customer {}", customer_id)));
            }
        };

        match self.ledger.downgrade(profile.id).await {
            Ok(_) => Ok(WebhookOutcome::Downgraded {
                user_id: profile.id,
            }),
            Err(PaymentError::NotFound(_)) => {
                warn!("Subscription deleted for {} with no subscription row", profile.id);
                Ok(WebhookOutcome::Ignored("no subscription".into()))
            }
            Err(e) => Err(e),
        }
    }

    async fn subscription_updated(
        &self,
        customer_id: &str,
        status: &str,
        period_end: Option<DateTime<Utc>>,
    ) -> PaymentResult<WebhookOutcome> {
        let profile = match self.profiles.find_by_customer(customer_id).await? {
            Some(profile) => profile,
            None => {
                warn!("Subscription updated for unknown customer {}", customer_id);
                return Ok(WebhookOutcome::Ignored(format!("unknown customer {}", customer_id)));
            }
        };

        let (mapped, terminal) = map_processor_status(status);
        match self
            .ledger
            .apply_processor_status(profile.id, mapped, period_end)
            .await
        {
            Ok(_) => {}
            Err(PaymentError::NotFound(_)) => {
                warn!("Subscription updated for {} with no subscription row", profile.id);
                return Ok(WebhookOutcome::Ignored("no subscription".into()));
            }
            Err(e) => return Err(e),
        }

        if terminal {
            self.ledger.downgrade(profile.id).await?;
            return Ok(WebhookOutcome::Downgraded {
                user_id: profile.id,
            });
        }

        Ok(WebhookOutcome::StatusUpdated {
            user_id: profile.id,
            status: mapped,
        })
    }
}
