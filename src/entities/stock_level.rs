use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::StockLevel;

/// Product stock ledger. Written only through version-checked updates.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_levels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub product_id: Uuid,
    pub available: i64,
    pub reserved: i64,
    pub version: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for StockLevel {
    fn from(model: Model) -> Self {
        Self {
            product_id: model.product_id,
            available: model.available,
            reserved: model.reserved,
            version: model.version,
        }
    }
}

impl From<&StockLevel> for ActiveModel {
    fn from(level: &StockLevel) -> Self {
        Self {
            product_id: Set(level.product_id),
            available: Set(level.available),
            reserved: Set(level.reserved),
            version: Set(level.version),
        }
    }
}
