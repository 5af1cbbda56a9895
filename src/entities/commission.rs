use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Commission;

/// One row per (order, seller); the composite key keeps records write-once.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "commissions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub order_id: Uuid,
    #[sea_orm(primary_key, auto_increment = false)]
    pub seller_id: Uuid,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for Commission {
    fn from(model: Model) -> Self {
        Self {
            order_id: model.order_id,
            seller_id: model.seller_id,
            amount: model.amount,
            created_at: model.created_at,
        }
    }
}

impl From<&Commission> for ActiveModel {
    fn from(commission: &Commission) -> Self {
        Self {
            order_id: Set(commission.order_id),
            seller_id: Set(commission.seller_id),
            amount: Set(commission.amount),
            created_at: Set(commission.created_at),
        }
    }
}
