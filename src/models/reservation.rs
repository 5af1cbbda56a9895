use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Status for stock reservations held on behalf of an order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Held,
    Finalized,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i64,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the product stock ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub product_id: Uuid,
    pub available: i64,
    pub reserved: i64,
    pub version: i64,
}

impl StockLevel {
    pub fn sellable(&self) -> i64 {
        self.available - self.reserved
    }

    pub fn is_consistent(&self) -> bool {
        self.available >= 0 && self.reserved >= 0 && self.reserved <= self.available
    }
}

/// Read-only view handed to the catalog collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub product_id: Uuid,
    pub available: i64,
    pub reserved: i64,
    pub sellable: i64,
}

impl From<StockLevel> for Availability {
    fn from(level: StockLevel) -> Self {
        Self {
            product_id: level.product_id,
            available: level.available,
            reserved: level.reserved,
            sellable: level.sellable(),
        }
    }
}
