//! Router tests against in-memory backends

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use subgate_api::{router, AppState};
use subgate_payment::config::USDC_MINT_MAINNET;
use subgate_payment::solana::{Asset, ChainTransaction, TransferRecord};
use subgate_payment::store::ProfileStore;
use subgate_payment::stripe::{compute_signature, CheckoutRequest, CheckoutSession};
use subgate_payment::{
    CheckoutApi, Engine, InMemoryChain, MemoryStore, PaymentResult, Profile, SubgateConfig,
};
use tower::ServiceExt;

const TREASURY: &str = "TreasuryWa11et1111111111111111111111111111";
const SECRET: &str = "whsec_api_test";

struct FixedCheckout;

#[async_trait]
impl CheckoutApi for FixedCheckout {
    async fn create_session(&self, request: &CheckoutRequest) -> PaymentResult<CheckoutSession> {
        Ok(CheckoutSession {
            id: "cs_test".to_string(),
            url: Some(format!("https://checkout.stripe.com/c/pay/{}", request.price_id)),
        })
    }
}

struct Harness {
    app: Router,
    chain: Arc<InMemoryChain>,
    store: Arc<MemoryStore>,
}

fn harness() -> Harness {
    let mut config = SubgateConfig::default();
    config.solana.treasury_address = TREASURY.to_string();
    config.stripe.webhook_secret = SECRET.to_string();
    config.stripe.price_ids.pro_monthly = "price_monthly".to_string();
    config.stripe.price_ids.pro_yearly = "price_yearly".to_string();

    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(InMemoryChain::new());
    let engine =
        Engine::new(store.clone(), chain.clone(), Arc::new(FixedCheckout), &config).unwrap();
    let app = router(AppState::new(engine), Duration::from_secs(10));

    Harness { app, chain, store }
}

fn signature(tag: &str) -> String {
    format!("{:5<88}", tag)
}

fn usdc_transfer(sig: &str, amount: u64) -> ChainTransaction {
    ChainTransaction {
        signature: sig.to_string(),
        slot: 1,
        block_time: Some(Utc::now().timestamp() - 60),
        failed: false,
        transfers: vec![TransferRecord {
            asset: Asset::Token {
                mint: Some(USDC_MINT_MAINNET.to_string()),
            },
            source: "PayerUsdcAccount".to_string(),
            destination: "TreasuryUsdcAccount".to_string(),
            destination_owner: Some(TREASURY.to_string()),
            amount,
        }],
        memos: Vec::new(),
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    read(app.clone().oneshot(request).await.unwrap()).await
}

async fn read(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn webhook(app: &Router, payload: &[u8], header: Option<String>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/payment-processor");
    if let Some(header) = header {
        builder = builder.header("stripe-signature", header);
    }
    let request = builder.body(Body::from(payload.to_vec())).unwrap();
    read(app.clone().oneshot(request).await.unwrap()).await
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let (status, body) = send(&h.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_intent_flow_and_cross_path_replay() {
    let h = harness();
    let profile = Profile::for_email("payer@example.com");
    h.store.insert_profile(&profile).await.unwrap();

    let (status, intent) = send(
        &h.app,
        "POST",
        "/payments/intents",
        Some(json!({ "userId": profile.id, "plan": "pro_yearly", "currency": "USDC" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(intent["amountAtomic"], 99_990_000u64);
    assert_eq!(intent["currency"], "USDC");
    assert_eq!(intent["treasuryAddress"], TREASURY);
    let payment_id = intent["paymentId"].as_str().unwrap().to_string();

    let sig = signature("ApiYearly");
    h.chain.insert(usdc_transfer(&sig, 99_990_000));

    let verify_uri = format!("/payments/intents/{}/verify", payment_id);
    let (status, body) = send(&h.app, "PUT", &verify_uri, Some(json!({ "signature": sig }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["plan"], "pro");
    assert!(body.get("alreadyProcessed").is_none());

    let (status, body) = send(&h.app, "PUT", &verify_uri, Some(json!({ "signature": sig }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alreadyProcessed"], true);

    let (status, body) = send(
        &h.app,
        "POST",
        "/subscriptions/wallet-activate",
        Some(json!({ "walletAddress": "OtherWa11et", "plan": "pro_yearly", "signature": sig })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "REPLAY_DETECTED");

    let (status, body) = send(&h.app, "GET", &format!("/subscriptions/{}", profile.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["paymentMethod"], "crypto");
    assert_eq!(body["entitled"], true);

    let (status, body) = send(&h.app, "GET", &format!("/payments/intents/{}", payment_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn test_wallet_activate() {
    let h = harness();
    let sig = signature("ApiWalkup");
    h.chain.insert(usdc_transfer(&sig, 9_990_000));

    let (status, body) = send(
        &h.app,
        "POST",
        "/subscriptions/wallet-activate",
        Some(json!({ "walletAddress": "WalkWa11et", "plan": "pro_monthly", "signature": sig, "currency": "USDC" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"], "pro");
    assert!(h.store.find_by_wallet("WalkWa11et").await.unwrap().is_some());
}

#[tokio::test]
async fn test_request_errors() {
    let h = harness();
    let profile = Profile::for_email("e@example.com");
    h.store.insert_profile(&profile).await.unwrap();

    let (status, body) = send(
        &h.app,
        "POST",
        "/payments/intents",
        Some(json!({ "userId": profile.id, "plan": "enterprise", "currency": "USDC" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PLAN");

    let (status, body) = send(
        &h.app,
        "POST",
        "/payments/intents",
        Some(json!({ "userId": profile.id, "plan": "pro_monthly", "currency": "DOGE" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_CURRENCY");

    let (status, body) = send(
        &h.app,
        "POST",
        "/payments/intents",
        Some(json!({ "userId": uuid::Uuid::new_v4(), "plan": "pro_monthly", "currency": "SOL" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send(&h.app, "POST", "/payments/intents", Some(json!({ "plan": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_short_payment_is_unprocessable() {
    let h = harness();
    let profile = Profile::for_email("short@example.com");
    h.store.insert_profile(&profile).await.unwrap();

    let (_, intent) = send(
        &h.app,
        "POST",
        "/payments/intents",
        Some(json!({ "userId": profile.id, "plan": "pro_monthly", "currency": "USDC" })),
    )
    .await;
    let payment_id = intent["paymentId"].as_str().unwrap().to_string();

    let sig = signature("ApiShort");
    h.chain.insert(usdc_transfer(&sig, 1_000_000));

    let (status, body) = send(
        &h.app,
        "PUT",
        &format!("/payments/intents/{}/verify", payment_id),
        Some(json!({ "signature": sig })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VERIFICATION_FAILED");
    assert_eq!(body["retriable"], false);
}

#[tokio::test]
async fn test_checkout_session() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        "POST",
        "/checkout/sessions",
        Some(json!({ "plan": "pro_monthly", "email": "card@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["url"], "https://checkout.stripe.com/c/pay/price_monthly");
}

#[tokio::test]
async fn test_webhook_signatures() {
    let h = harness();
    let payload = json!({
        "id": "evt_api_1",
        "type": "invoice.finalized",
        "data": { "object": {} }
    })
    .to_string();
    let now = Utc::now().timestamp();

    let (status, body) = webhook(&h.app, payload.as_bytes(), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_SIGNATURE");

    let forged = format!("t={},v1={}", now, "00".repeat(32));
    let (status, _) = webhook(&h.app, payload.as_bytes(), Some(forged)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let valid = format!(
        "t={},v1={}",
        now,
        compute_signature(SECRET, now, payload.as_bytes()).unwrap()
    );
    let (status, body) = webhook(&h.app, payload.as_bytes(), Some(valid)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "ignored");
}

#[tokio::test]
async fn test_webhook_checkout_activates() {
    let h = harness();
    let payload = json!({
        "id": "evt_api_2",
        "type": "checkout.session.completed",
        "data": { "object": {
            "customer": "cus_api",
            "subscription": "sub_api",
            "customer_email": "hook@example.com"
        } }
    })
    .to_string();
    let now = Utc::now().timestamp();
    let header = format!(
        "t={},v1={}",
        now,
        compute_signature(SECRET, now, payload.as_bytes()).unwrap()
    );

    let (status, body) = webhook(&h.app, payload.as_bytes(), Some(header.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "activated");

    let profile = h.store.find_by_customer("cus_api").await.unwrap().unwrap();
    let (_, sub) = send(&h.app, "GET", &format!("/subscriptions/{}", profile.id), None).await;
    assert_eq!(sub["paymentMethod"], "stripe");
    assert_eq!(sub["stripeSubscriptionId"], "sub_api");

    let (status, body) = webhook(&h.app, payload.as_bytes(), Some(header)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "duplicate");
}
