use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::parse_column;
use crate::errors::ServiceError;
use crate::models::Reservation;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reservations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(indexed)]
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i64,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn into_domain(self) -> Result<Reservation, ServiceError> {
        Ok(Reservation {
            id: self.id,
            order_id: self.order_id,
            product_id: self.product_id,
            quantity: self.quantity,
            status: parse_column(&self.status, "reservations.status")?,
            expires_at: self.expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl From<&Reservation> for ActiveModel {
    fn from(reservation: &Reservation) -> Self {
        Self {
            id: Set(reservation.id),
            order_id: Set(reservation.order_id),
            product_id: Set(reservation.product_id),
            quantity: Set(reservation.quantity),
            status: Set(reservation.status.to_string()),
            expires_at: Set(reservation.expires_at),
            created_at: Set(reservation.created_at),
            updated_at: Set(reservation.updated_at),
        }
    }
}
