use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::BuyerId;
use crate::errors::ServiceError;
use crate::models::{OrderStatus, OrderTotals};
use crate::services::checkout::{CheckoutRequest, CheckoutResult};
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutBody {
    pub cart_id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub coupon_code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub payment_client_secret: Option<String>,
    pub totals: OrderTotals,
    pub currency: String,
    pub replayed: bool,
}

impl From<CheckoutResult> for CheckoutResponse {
    fn from(result: CheckoutResult) -> Self {
        Self {
            order_id: result.order.id,
            status: result.order.status,
            payment_client_secret: result.order.payment_client_secret,
            totals: result.order.totals,
            currency: result.order.currency,
            replayed: result.replayed,
        }
    }
}

/// POST /api/v1/checkout
///
/// A repeated request for an unchanged cart answers with the order created
/// the first time and `replayed: true`.
pub async fn checkout(
    State(state): State<AppState>,
    BuyerId(buyer_id): BuyerId,
    Json(body): Json<CheckoutBody>,
) -> Result<(StatusCode, Json<CheckoutResponse>), ServiceError> {
    body.validate()?;

    let result = state
        .checkout
        .checkout(CheckoutRequest {
            cart_id: body.cart_id,
            buyer_id,
            coupon_code: body.coupon_code,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(result.into())))
}
