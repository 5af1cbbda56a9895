//! Transactional persistence.
//!
//! Every engine operation runs inside one [`StoreTx`]. Nothing becomes
//! visible to other transactions until [`StoreTx::commit`]; dropping a
//! transaction without committing discards its writes. Version-checked
//! updates (`compare_and_swap_*`, `update_order`) return `false` when the
//! row changed underneath the caller, leaving the retry policy to the
//! caller.

mod database;
mod memory;

pub use database::DatabaseStore;
pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{
    Cart, Commission, Coupon, Order, OrphanEvent, ProcessedEvent, Reservation, StockLevel,
};

#[async_trait]
pub trait CartRepository: Send {
    async fn get_cart(&mut self, id: Uuid) -> Result<Option<Cart>, ServiceError>;
    /// Inserts or replaces the cart.
    async fn save_cart(&mut self, cart: &Cart) -> Result<(), ServiceError>;
    async fn delete_cart(&mut self, id: Uuid) -> Result<bool, ServiceError>;
}

#[async_trait]
pub trait CouponRepository: Send {
    async fn get_coupon(&mut self, code: &str) -> Result<Option<Coupon>, ServiceError>;
    /// Inserts the coupon or replaces its definition. An existing usage
    /// count is kept; `coupon.usage_count` only seeds a new row.
    async fn save_coupon(&mut self, coupon: &Coupon) -> Result<(), ServiceError>;
    /// Increments the usage counter and returns the updated coupon.
    async fn increment_coupon_usage(&mut self, code: &str)
        -> Result<Option<Coupon>, ServiceError>;
}

#[async_trait]
pub trait LedgerRepository: Send {
    async fn get_stock(&mut self, product_id: Uuid) -> Result<Option<StockLevel>, ServiceError>;
    async fn insert_stock(&mut self, level: &StockLevel) -> Result<(), ServiceError>;
    /// Writes `level` (with `version = expected_version + 1`) only if the
    /// stored row is still at `expected_version`.
    async fn compare_and_swap_stock(
        &mut self,
        level: &StockLevel,
        expected_version: i64,
    ) -> Result<bool, ServiceError>;
    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), ServiceError>;
    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<(), ServiceError>;
    async fn reservations_for_order(
        &mut self,
        order_id: Uuid,
    ) -> Result<Vec<Reservation>, ServiceError>;
}

#[async_trait]
pub trait OrderRepository: Send {
    async fn insert_order(&mut self, order: &Order) -> Result<(), ServiceError>;
    async fn get_order(&mut self, id: Uuid) -> Result<Option<Order>, ServiceError>;
    async fn find_order_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> Result<Option<Order>, ServiceError>;
    async fn find_order_by_payment_intent(
        &mut self,
        payment_intent_id: &str,
    ) -> Result<Option<Order>, ServiceError>;
    /// Persists the mutable order fields if the stored version still equals
    /// `expected_version`. The caller sets `order.version` to the new value.
    async fn update_order(
        &mut self,
        order: &Order,
        expected_version: i64,
    ) -> Result<bool, ServiceError>;
    /// Ids of `PENDING_PAYMENT` orders created before `cutoff`, oldest first.
    async fn pending_orders_created_before(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError>;
}

#[async_trait]
pub trait PaymentEventRepository: Send {
    async fn get_processed_event(
        &mut self,
        event_id: &str,
    ) -> Result<Option<ProcessedEvent>, ServiceError>;
    /// Insert-if-absent. Returns `false` when the id was already recorded.
    async fn insert_processed_event(
        &mut self,
        event: &ProcessedEvent,
    ) -> Result<bool, ServiceError>;
    /// Keeps the first recording when the same event arrives twice.
    async fn record_orphan(&mut self, orphan: &OrphanEvent) -> Result<(), ServiceError>;
    async fn orphans_for_intent(
        &mut self,
        payment_intent_id: &str,
    ) -> Result<Vec<OrphanEvent>, ServiceError>;
    async fn delete_orphan(&mut self, event_id: &str) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait CommissionRepository: Send {
    /// Insert-if-absent on (order, seller).
    async fn insert_commission(&mut self, commission: &Commission) -> Result<bool, ServiceError>;
    async fn commissions_for_order(
        &mut self,
        order_id: Uuid,
    ) -> Result<Vec<Commission>, ServiceError>;
}

#[async_trait]
pub trait StoreTx:
    CartRepository
    + CouponRepository
    + LedgerRepository
    + OrderRepository
    + PaymentEventRepository
    + CommissionRepository
    + Send
{
    async fn commit(self: Box<Self>) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, ServiceError>;

    async fn health_check(&self) -> Result<(), ServiceError>;
}
