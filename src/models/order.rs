use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

use super::{cart::VariantOptions, commission::SellerCommission};

/// Order lifecycle states.
///
/// `Draft` only exists in memory while checkout assembles the order; it is
/// never persisted.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Draft,
    PendingPayment,
    Paid,
    Fulfilling,
    Shipped,
    Delivered,
    PaymentFailed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    /// The complete transition table. Anything not listed is illegal.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Draft, PendingPayment)
                | (PendingPayment, Paid)
                | (PendingPayment, PaymentFailed)
                | (PendingPayment, Cancelled)
                | (Paid, Fulfilling)
                | (Paid, Refunded)
                | (Fulfilling, Shipped)
                | (Shipped, Delivered)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::PaymentFailed
                | OrderStatus::Cancelled
                | OrderStatus::Delivered
                | OrderStatus::Refunded
        )
    }
}

/// What caused a transition. Recorded in logs alongside the status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransitionTrigger {
    Checkout,
    PaymentSucceeded,
    PaymentFailed,
    SynchronousDecline,
    Expiry,
    BuyerCancellation,
    Fulfillment,
    Refund,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub category: Option<String>,
    #[serde(default)]
    pub options: VariantOptions,
    pub quantity: i64,
    /// Live catalog price at checkout time.
    pub unit_price: i64,
    pub line_total: i64,
    /// Share of the order discount allocated to this line.
    pub discount: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: i64,
    pub discount: i64,
    pub tax: i64,
    pub shipping: i64,
    pub commission: i64,
    pub grand_total: i64,
}

impl OrderTotals {
    /// `subtotal - discount + tax + shipping == grand_total` and nothing is
    /// negative.
    pub fn is_balanced(&self) -> bool {
        self.subtotal - self.discount + self.tax + self.shipping == self.grand_total
            && self.grand_total >= 0
            && self.discount >= 0
            && self.discount <= self.subtotal
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub buyer_id: String,
    pub cart_id: Uuid,
    pub lines: Vec<OrderLine>,
    pub totals: OrderTotals,
    pub seller_commissions: Vec<SellerCommission>,
    pub coupon_code: Option<String>,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_intent_id: Option<String>,
    pub payment_client_secret: Option<String>,
    pub idempotency_key: String,
    /// Optimistic concurrency counter, bumped on every persisted change.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn subtotal_matches_lines(&self) -> bool {
        self.lines
            .iter()
            .map(|line| line.unit_price * line.quantity)
            .sum::<i64>()
            == self.totals.subtotal
    }
}
