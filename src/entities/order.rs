use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{from_json, parse_column, to_json};
use crate::errors::ServiceError;
use crate::models::Order;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub buyer_id: String,
    pub cart_id: Uuid,
    pub lines: Json,
    pub totals: Json,
    pub seller_commissions: Json,
    pub coupon_code: Option<String>,
    pub currency: String,
    #[sea_orm(indexed)]
    pub status: String,
    #[sea_orm(indexed)]
    pub payment_intent_id: Option<String>,
    pub payment_client_secret: Option<String>,
    #[sea_orm(unique)]
    pub idempotency_key: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_domain(self) -> Result<Order, ServiceError> {
        Ok(Order {
            id: self.id,
            buyer_id: self.buyer_id,
            cart_id: self.cart_id,
            lines: from_json(self.lines)?,
            totals: from_json(self.totals)?,
            seller_commissions: from_json(self.seller_commissions)?,
            coupon_code: self.coupon_code,
            currency: self.currency,
            status: parse_column(&self.status, "orders.status")?,
            payment_intent_id: self.payment_intent_id,
            payment_client_secret: self.payment_client_secret,
            idempotency_key: self.idempotency_key,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl ActiveModel {
    pub fn from_domain(order: &Order) -> Result<Self, ServiceError> {
        Ok(Self {
            id: Set(order.id),
            buyer_id: Set(order.buyer_id.clone()),
            cart_id: Set(order.cart_id),
            lines: Set(to_json(&order.lines)?),
            totals: Set(to_json(&order.totals)?),
            seller_commissions: Set(to_json(&order.seller_commissions)?),
            coupon_code: Set(order.coupon_code.clone()),
            currency: Set(order.currency.clone()),
            status: Set(order.status.to_string()),
            payment_intent_id: Set(order.payment_intent_id.clone()),
            payment_client_secret: Set(order.payment_client_secret.clone()),
            idempotency_key: Set(order.idempotency_key.clone()),
            version: Set(order.version),
            created_at: Set(order.created_at),
            updated_at: Set(order.updated_at),
        })
    }
}
