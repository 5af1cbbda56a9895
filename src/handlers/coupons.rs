use axum::{
    extract::{Path, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use validator::Validate;

use super::Operator;
use crate::errors::ServiceError;
use crate::models::{Coupon, CouponScope, DiscountKind};
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CouponDefinition {
    pub discount: DiscountKind,
    #[serde(default)]
    pub scope: CouponScope,
    #[validate(range(min = 0))]
    pub min_subtotal: Option<i64>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i64>,
}

pub async fn get_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Coupon>, ServiceError> {
    let coupon = state
        .coupons
        .get(&code)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Coupon {code} not found")))?;
    Ok(Json(coupon))
}

/// PUT /api/v1/coupons/:code
///
/// Replaces the definition; the usage count carries over.
pub async fn upsert_coupon(
    _operator: Operator,
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(body): Json<CouponDefinition>,
) -> Result<Json<Coupon>, ServiceError> {
    body.validate()?;
    let coupon = state
        .coupons
        .upsert(Coupon {
            code,
            discount: body.discount,
            scope: body.scope,
            min_subtotal: body.min_subtotal,
            starts_at: body.starts_at,
            expires_at: body.expires_at,
            usage_limit: body.usage_limit,
            usage_count: 0,
        })
        .await?;
    Ok(Json(coupon))
}
