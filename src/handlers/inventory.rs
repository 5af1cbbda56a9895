use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::Operator;
use crate::errors::ServiceError;
use crate::models::{Availability, StockLevel};
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct RestockRequest {
    #[validate(range(min = 1))]
    pub quantity: i64,
}

/// GET /api/v1/inventory/:product_id/availability
pub async fn get_availability(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<Availability>, ServiceError> {
    let availability = state.inventory.availability(product_id).await?;
    Ok(Json(availability))
}

pub async fn restock(
    _operator: Operator,
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(body): Json<RestockRequest>,
) -> Result<Json<StockLevel>, ServiceError> {
    body.validate()?;
    let level = state.inventory.restock(product_id, body.quantity).await?;
    Ok(Json(level))
}
