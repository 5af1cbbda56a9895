use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{BuyerId, Operator};
use crate::errors::ServiceError;
use crate::models::{Commission, Order, OrderStatus};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct FulfillmentRequest {
    /// `FULFILLING`, `SHIPPED` or `DELIVERED`.
    pub status: OrderStatus,
}

pub async fn get_order(
    State(state): State<AppState>,
    BuyerId(buyer_id): BuyerId,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ServiceError> {
    let order = state.orders.get_order(order_id, &buyer_id).await?;
    Ok(Json(order))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    BuyerId(buyer_id): BuyerId,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ServiceError> {
    let order = state.orders.cancel_order(order_id, &buyer_id).await?;
    Ok(Json(order))
}

pub async fn advance_fulfillment(
    _operator: Operator,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(body): Json<FulfillmentRequest>,
) -> Result<Json<Order>, ServiceError> {
    let order = state
        .orders
        .advance_fulfillment(order_id, body.status)
        .await?;
    Ok(Json(order))
}

pub async fn list_commissions(
    _operator: Operator,
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<Commission>>, ServiceError> {
    let commissions = state.orders.commissions(order_id).await?;
    Ok(Json(commissions))
}
