#![allow(dead_code)]

pub mod intercept;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use marketplace_checkout::{
    build_router,
    config::AppConfig,
    errors::ServiceError,
    models::{
        Cart, Commission, Order, PaymentEvent, PaymentEventKind, PaymentIntent, StockLevel,
        VariantOptions,
    },
    services::{
        catalog::{InMemoryCatalog, ProductPrice},
        checkout::{idempotency_key, CheckoutRequest, CheckoutResult},
        notifications::{Notification, NotificationKind, Notifier},
        payment_gateway::{GatewayError, IntentOutcome, IntentRequest, PaymentGateway},
    },
    store::{InMemoryStore, Store},
    AppState, Collaborators,
};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const OPERATOR_KEY: &str = "op_test_key";

/// What the scripted gateway does with the next intent request.
#[derive(Debug, Clone)]
pub enum GatewayStep {
    Create,
    CreateWithId(String),
    Decline(String),
    Timeout,
    Unavailable,
    /// Never answers within any sane timeout.
    Hang,
}

/// Gateway that follows a script, then creates intents once it runs out.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<GatewayStep>>,
    requests: Mutex<Vec<IntentRequest>>,
}

impl ScriptedGateway {
    pub fn push(&self, step: GatewayStep) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn requests(&self) -> Vec<IntentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_intent(&self, request: &IntentRequest) -> Result<IntentOutcome, GatewayError> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(GatewayStep::Create);

        let created = |id: String| {
            IntentOutcome::Created(PaymentIntent {
                client_secret: format!("{id}_secret"),
                id,
            })
        };
        match step {
            GatewayStep::Create => Ok(created(format!("pi_{}", request.order_id.simple()))),
            GatewayStep::CreateWithId(id) => Ok(created(id)),
            GatewayStep::Decline(reason) => Ok(IntentOutcome::Declined { reason }),
            GatewayStep::Timeout => Err(GatewayError::Timeout),
            GatewayStep::Unavailable => Err(GatewayError::Unavailable("scripted outage".into())),
            GatewayStep::Hang => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Err(GatewayError::Timeout)
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn kinds_for(&self, order_id: Uuid) -> Vec<NotificationKind> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.order_id == order_id)
            .map(|n| n.kind)
            .collect()
    }

    /// Delivery is asynchronous; poll briefly for the notification.
    pub async fn wait_for(&self, order_id: Uuid, kind: NotificationKind) -> bool {
        for _ in 0..100 {
            if self.kinds_for(order_id).contains(&kind) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ServiceError> {
        self.seen.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.checkout_timeout_ms = 2_000;
    cfg.gateway_timeout_ms = 200;
    cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());
    cfg.operator_api_key = Some(OPERATOR_KEY.to_string());
    cfg
}

/// Application wired against an in-memory store, a static catalog, a
/// scripted gateway and a recording notifier.
pub struct TestHarness {
    pub state: AppState,
    pub router: Router,
    pub store: Arc<dyn Store>,
    pub catalog: Arc<InMemoryCatalog>,
    pub gateway: Arc<ScriptedGateway>,
    pub notifier: Arc<RecordingNotifier>,
    _notification_worker: tokio::task::JoinHandle<()>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(cfg: AppConfig) -> Self {
        Self::with_store(cfg, Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(cfg: AppConfig, store: Arc<dyn Store>) -> Self {
        let catalog = Arc::new(InMemoryCatalog::new());
        let gateway = Arc::new(ScriptedGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let (state, worker) = AppState::build(
            cfg,
            Collaborators {
                store: store.clone(),
                catalog: catalog.clone(),
                gateway: gateway.clone(),
                notifier: notifier.clone(),
            },
        )
        .expect("wire application state");

        Self {
            router: build_router(state.clone()),
            state,
            store,
            catalog,
            gateway,
            notifier,
            _notification_worker: worker,
        }
    }

    /// Registers a product with a fresh seller and stocks it.
    pub async fn seed_product(&self, unit_price: i64, stock: i64) -> ProductPrice {
        self.seed_product_for(Uuid::new_v4(), unit_price, stock, None)
            .await
    }

    pub async fn seed_product_for(
        &self,
        seller_id: Uuid,
        unit_price: i64,
        stock: i64,
        category: Option<&str>,
    ) -> ProductPrice {
        let price = ProductPrice {
            product_id: Uuid::new_v4(),
            seller_id,
            category: category.map(str::to_string),
            unit_price,
        };
        self.catalog.upsert(price.clone());
        self.state
            .inventory
            .restock(price.product_id, stock)
            .await
            .expect("seed stock");
        price
    }

    pub async fn cart_with(&self, buyer_id: &str, lines: &[(Uuid, i32)]) -> Cart {
        let mut cart = self.state.carts.create(buyer_id).await.expect("create cart");
        for (product_id, quantity) in lines {
            cart = self
                .state
                .carts
                .add_line(cart.id, buyer_id, *product_id, *quantity, VariantOptions::new())
                .await
                .expect("add cart line");
        }
        cart
    }

    pub async fn checkout(
        &self,
        buyer_id: &str,
        cart_id: Uuid,
        coupon_code: Option<&str>,
    ) -> Result<CheckoutResult, ServiceError> {
        self.state
            .checkout
            .checkout(CheckoutRequest {
                cart_id,
                buyer_id: buyer_id.to_string(),
                coupon_code: coupon_code.map(str::to_string),
            })
            .await
    }

    pub async fn order(&self, order_id: Uuid) -> Order {
        let mut tx = self.store.begin().await.expect("begin");
        let order = tx
            .get_order(order_id)
            .await
            .expect("read order")
            .expect("order exists");
        order
    }

    /// Finds the order checkout created for this cart state, even when the
    /// checkout call itself returned an error.
    pub async fn order_for_cart(&self, cart: &Cart) -> Option<Order> {
        let key = idempotency_key(cart.id, &cart.buyer_id, cart.updated_at);
        let mut tx = self.store.begin().await.expect("begin");
        let order = tx
            .find_order_by_idempotency_key(&key)
            .await
            .expect("lookup by idempotency key");
        order
    }

    pub async fn stock(&self, product_id: Uuid) -> StockLevel {
        let mut tx = self.store.begin().await.expect("begin");
        let level = tx
            .get_stock(product_id)
            .await
            .expect("read stock")
            .expect("stock row exists");
        level
    }

    pub async fn commissions(&self, order_id: Uuid) -> Vec<Commission> {
        self.state
            .orders
            .commissions(order_id)
            .await
            .expect("read commissions")
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    pub async fn send_json(
        &self,
        method: Method,
        uri: &str,
        buyer_id: Option<&str>,
        body: Option<Value>,
    ) -> Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(buyer) = buyer_id {
            builder = builder.header("x-buyer-id", buyer);
        }
        let body = body.map_or_else(Body::empty, |v| Body::from(v.to_string()));
        self.send(builder.body(body).expect("request")).await
    }

    /// Sends a JSON request to a back-office route with the given key.
    pub async fn send_operator(
        &self,
        method: Method,
        uri: &str,
        operator_key: Option<&str>,
        body: Option<Value>,
    ) -> Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = operator_key {
            builder = builder.header("x-api-key", key);
        }
        let body = body.map_or_else(Body::empty, |v| Body::from(v.to_string()));
        self.send(builder.body(body).expect("request")).await
    }
}

pub fn payment_event(id: &str, kind: PaymentEventKind, payment_intent_id: &str) -> PaymentEvent {
    PaymentEvent {
        id: id.to_string(),
        kind,
        payment_intent_id: payment_intent_id.to_string(),
        payload: serde_json::json!({ "id": id }),
        received_at: Utc::now(),
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
