use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-seller commission computed at pricing time and frozen on the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerCommission {
    pub seller_id: Uuid,
    /// Seller's gross share of the order subtotal.
    pub seller_subtotal: i64,
    pub amount: i64,
}

/// Commission record written once when an order becomes `PAID`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    pub order_id: Uuid,
    pub seller_id: Uuid,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}
