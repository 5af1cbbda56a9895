use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{from_json, parse_column, to_json};
use crate::errors::ServiceError;
use crate::models::Cart;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "carts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(indexed)]
    pub buyer_id: String,
    pub lines: Json,
    pub coupon_code: Option<String>,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_domain(self) -> Result<Cart, ServiceError> {
        Ok(Cart {
            id: self.id,
            buyer_id: self.buyer_id,
            lines: from_json(self.lines)?,
            coupon_code: self.coupon_code,
            status: parse_column(&self.status, "carts.status")?,
            updated_at: self.updated_at,
        })
    }
}

impl ActiveModel {
    pub fn from_domain(cart: &Cart) -> Result<Self, ServiceError> {
        Ok(Self {
            id: Set(cart.id),
            buyer_id: Set(cart.buyer_id.clone()),
            lines: Set(to_json(&cart.lines)?),
            coupon_code: Set(cart.coupon_code.clone()),
            status: Set(cart.status.to_string()),
            updated_at: Set(cart.updated_at),
        })
    }
}
