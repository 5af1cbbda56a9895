use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

use super::{from_json, to_json};
use crate::errors::ServiceError;
use crate::models::Coupon;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupons")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub code: String,
    pub discount: Json,
    pub scope: Json,
    pub min_subtotal: Option<i64>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_limit: Option<i64>,
    pub usage_count: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_domain(self) -> Result<Coupon, ServiceError> {
        Ok(Coupon {
            code: self.code,
            discount: from_json(self.discount)?,
            scope: from_json(self.scope)?,
            min_subtotal: self.min_subtotal,
            starts_at: self.starts_at,
            expires_at: self.expires_at,
            usage_limit: self.usage_limit,
            usage_count: self.usage_count,
        })
    }
}

impl ActiveModel {
    pub fn from_domain(coupon: &Coupon) -> Result<Self, ServiceError> {
        Ok(Self {
            code: Set(coupon.code.clone()),
            discount: Set(to_json(&coupon.discount)?),
            scope: Set(to_json(&coupon.scope)?),
            min_subtotal: Set(coupon.min_subtotal),
            starts_at: Set(coupon.starts_at),
            expires_at: Set(coupon.expires_at),
            usage_limit: Set(coupon.usage_limit),
            usage_count: Set(coupon.usage_count),
        })
    }
}
