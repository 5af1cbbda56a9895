pub mod carts;
pub mod checkout;
pub mod coupons;
pub mod health;
pub mod inventory;
pub mod orders;
pub mod payment_webhooks;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    routing::{get, post, put},
    Router,
};

use tracing::warn;

use crate::errors::ServiceError;
use crate::AppState;

/// Header set by the upstream authentication layer.
pub const BUYER_ID_HEADER: &str = "x-buyer-id";

/// Header carrying the operator key on back-office routes.
pub const OPERATOR_KEY_HEADER: &str = "x-api-key";

/// Authenticated buyer (or guest session) making the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyerId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for BuyerId
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(BUYER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| BuyerId(value.to_string()))
            .ok_or_else(|| ServiceError::Unauthorized(format!("missing {BUYER_ID_HEADER} header")))
    }
}

/// Proof that the request carries the configured operator key. Required by
/// routes that change stock, coupons or fulfillment, or expose commissions.
#[derive(Debug, Clone, Copy)]
pub struct Operator;

#[async_trait]
impl FromRequestParts<AppState> for Operator {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let expected = state
            .config
            .operator_api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ServiceError::Unauthorized("operator access is disabled".to_string()))?;

        let presented = parts
            .headers
            .get(OPERATOR_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .ok_or_else(|| ServiceError::Unauthorized(format!("missing {OPERATOR_KEY_HEADER} header")))?;

        if constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
            Ok(Operator)
        } else {
            warn!("operator request with an unknown key");
            Err(ServiceError::Unauthorized("invalid operator key".to_string()))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn api_v1_routes() -> Router<AppState> {
    let carts = Router::new()
        .route("/carts", post(carts::create_cart))
        .route("/carts/:id", get(carts::get_cart).delete(carts::delete_cart))
        .route(
            "/carts/:id/lines",
            post(carts::add_line)
                .put(carts::set_quantity)
                .delete(carts::clear_cart),
        )
        .route("/carts/:id/coupon", put(carts::apply_coupon))
        .route("/carts/:id/merge", post(carts::merge_carts));

    let orders = Router::new()
        .route("/orders/:id", get(orders::get_order))
        .route("/orders/:id/cancel", post(orders::cancel_order))
        .route("/orders/:id/fulfillment", post(orders::advance_fulfillment))
        .route("/orders/:id/commissions", get(orders::list_commissions));

    let inventory = Router::new()
        .route(
            "/inventory/:product_id/availability",
            get(inventory::get_availability),
        )
        .route("/inventory/:product_id/restock", post(inventory::restock));

    let coupons = Router::new().route(
        "/coupons/:code",
        get(coupons::get_coupon).put(coupons::upsert_coupon),
    );

    Router::new()
        .route("/checkout", post(checkout::checkout))
        .route("/payments/webhook", post(payment_webhooks::payment_webhook))
        .merge(carts)
        .merge(orders)
        .merge(inventory)
        .merge(coupons)
}
