use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::BuyerId;
use crate::errors::ServiceError;
use crate::models::{Cart, VariantOptions};
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct AddLineRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i32,
    #[serde(default)]
    pub options: VariantOptions,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SetQuantityRequest {
    pub product_id: Uuid,
    /// Zero removes the line.
    #[validate(range(min = 0, max = 10000))]
    pub quantity: i32,
    #[serde(default)]
    pub options: VariantOptions,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyCouponRequest {
    #[validate(length(max = 64))]
    pub code: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MergeCartsRequest {
    pub source_cart_id: Uuid,
    /// Guest session token the source cart belongs to.
    #[validate(length(min = 1, max = 255))]
    pub source_owner: String,
}

pub async fn create_cart(
    State(state): State<AppState>,
    BuyerId(buyer_id): BuyerId,
) -> Result<(StatusCode, Json<Cart>), ServiceError> {
    let cart = state.carts.create(&buyer_id).await?;
    Ok((StatusCode::CREATED, Json(cart)))
}

pub async fn get_cart(
    State(state): State<AppState>,
    BuyerId(buyer_id): BuyerId,
    Path(cart_id): Path<Uuid>,
) -> Result<Json<Cart>, ServiceError> {
    let cart = state.carts.get(cart_id, &buyer_id).await?;
    Ok(Json(cart))
}

pub async fn delete_cart(
    State(state): State<AppState>,
    BuyerId(buyer_id): BuyerId,
    Path(cart_id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    state.carts.delete(cart_id, &buyer_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_line(
    State(state): State<AppState>,
    BuyerId(buyer_id): BuyerId,
    Path(cart_id): Path<Uuid>,
    Json(body): Json<AddLineRequest>,
) -> Result<Json<Cart>, ServiceError> {
    body.validate()?;
    let cart = state
        .carts
        .add_line(cart_id, &buyer_id, body.product_id, body.quantity, body.options)
        .await?;
    Ok(Json(cart))
}

pub async fn set_quantity(
    State(state): State<AppState>,
    BuyerId(buyer_id): BuyerId,
    Path(cart_id): Path<Uuid>,
    Json(body): Json<SetQuantityRequest>,
) -> Result<Json<Cart>, ServiceError> {
    body.validate()?;
    let cart = state
        .carts
        .set_quantity(cart_id, &buyer_id, body.product_id, body.options, body.quantity)
        .await?;
    Ok(Json(cart))
}

pub async fn clear_cart(
    State(state): State<AppState>,
    BuyerId(buyer_id): BuyerId,
    Path(cart_id): Path<Uuid>,
) -> Result<Json<Cart>, ServiceError> {
    let cart = state.carts.clear(cart_id, &buyer_id).await?;
    Ok(Json(cart))
}

pub async fn apply_coupon(
    State(state): State<AppState>,
    BuyerId(buyer_id): BuyerId,
    Path(cart_id): Path<Uuid>,
    Json(body): Json<ApplyCouponRequest>,
) -> Result<Json<Cart>, ServiceError> {
    body.validate()?;
    let cart = state
        .carts
        .apply_coupon(cart_id, &buyer_id, body.code)
        .await?;
    Ok(Json(cart))
}

pub async fn merge_carts(
    State(state): State<AppState>,
    BuyerId(buyer_id): BuyerId,
    Path(cart_id): Path<Uuid>,
    Json(body): Json<MergeCartsRequest>,
) -> Result<Json<Cart>, ServiceError> {
    body.validate()?;
    let cart = state
        .carts
        .merge(cart_id, &buyer_id, body.source_cart_id, &body.source_owner)
        .await?;
    Ok(Json(cart))
}
