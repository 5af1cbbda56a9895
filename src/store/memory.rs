use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    CartRepository, CommissionRepository, CouponRepository, LedgerRepository, OrderRepository,
    PaymentEventRepository, Store, StoreTx,
};
use crate::errors::ServiceError;
use crate::models::{
    Cart, Commission, Coupon, Order, OrderStatus, OrphanEvent, ProcessedEvent, Reservation,
    StockLevel,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    carts: HashMap<Uuid, Cart>,
    coupons: HashMap<String, Coupon>,
    stock: HashMap<Uuid, StockLevel>,
    reservations: HashMap<Uuid, Reservation>,
    orders: HashMap<Uuid, Order>,
    processed_events: HashMap<String, ProcessedEvent>,
    orphan_events: HashMap<String, OrphanEvent>,
    commissions: HashMap<(Uuid, Uuid), Commission>,
}

/// Process-local store for development and tests.
///
/// Transactions are serialized behind one async mutex. Each transaction
/// works on a copy of the state that replaces the shared state on commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, ServiceError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl CartRepository for MemoryTx {
    async fn get_cart(&mut self, id: Uuid) -> Result<Option<Cart>, ServiceError> {
        Ok(self.working.carts.get(&id).cloned())
    }

    async fn save_cart(&mut self, cart: &Cart) -> Result<(), ServiceError> {
        self.working.carts.insert(cart.id, cart.clone());
        Ok(())
    }

    async fn delete_cart(&mut self, id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.working.carts.remove(&id).is_some())
    }
}

#[async_trait]
impl CouponRepository for MemoryTx {
    async fn get_coupon(&mut self, code: &str) -> Result<Option<Coupon>, ServiceError> {
        Ok(self.working.coupons.get(code).cloned())
    }

    async fn save_coupon(&mut self, coupon: &Coupon) -> Result<(), ServiceError> {
        let mut next = coupon.clone();
        if let Some(existing) = self.working.coupons.get(&coupon.code) {
            next.usage_count = existing.usage_count;
        }
        self.working.coupons.insert(next.code.clone(), next);
        Ok(())
    }

    async fn increment_coupon_usage(
        &mut self,
        code: &str,
    ) -> Result<Option<Coupon>, ServiceError> {
        Ok(self.working.coupons.get_mut(code).map(|coupon| {
            coupon.usage_count += 1;
            coupon.clone()
        }))
    }
}

#[async_trait]
impl LedgerRepository for MemoryTx {
    async fn get_stock(&mut self, product_id: Uuid) -> Result<Option<StockLevel>, ServiceError> {
        Ok(self.working.stock.get(&product_id).cloned())
    }

    async fn insert_stock(&mut self, level: &StockLevel) -> Result<(), ServiceError> {
        if self.working.stock.contains_key(&level.product_id) {
            return Err(ServiceError::Conflict(format!(
                "Stock ledger entry for product {} already exists",
                level.product_id
            )));
        }
        self.working.stock.insert(level.product_id, level.clone());
        Ok(())
    }

    async fn compare_and_swap_stock(
        &mut self,
        level: &StockLevel,
        expected_version: i64,
    ) -> Result<bool, ServiceError> {
        match self.working.stock.get_mut(&level.product_id) {
            Some(current) if current.version == expected_version => {
                *current = StockLevel {
                    version: expected_version + 1,
                    ..level.clone()
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), ServiceError> {
        self.working
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<(), ServiceError> {
        match self.working.reservations.get_mut(&reservation.id) {
            Some(existing) => {
                *existing = reservation.clone();
                Ok(())
            }
            None => Err(ServiceError::NotFound(format!(
                "Reservation {} not found",
                reservation.id
            ))),
        }
    }

    async fn reservations_for_order(
        &mut self,
        order_id: Uuid,
    ) -> Result<Vec<Reservation>, ServiceError> {
        let mut found: Vec<Reservation> = self
            .working
            .reservations
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| (r.created_at, r.product_id));
        Ok(found)
    }
}

#[async_trait]
impl OrderRepository for MemoryTx {
    async fn insert_order(&mut self, order: &Order) -> Result<(), ServiceError> {
        let duplicate_key = self
            .working
            .orders
            .values()
            .any(|o| o.idempotency_key == order.idempotency_key);
        if duplicate_key || self.working.orders.contains_key(&order.id) {
            return Err(ServiceError::Conflict(format!(
                "Order {} already exists",
                order.id
            )));
        }
        self.working.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&mut self, id: Uuid) -> Result<Option<Order>, ServiceError> {
        Ok(self.working.orders.get(&id).cloned())
    }

    async fn find_order_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> Result<Option<Order>, ServiceError> {
        Ok(self
            .working
            .orders
            .values()
            .find(|o| o.idempotency_key == key)
            .cloned())
    }

    async fn find_order_by_payment_intent(
        &mut self,
        payment_intent_id: &str,
    ) -> Result<Option<Order>, ServiceError> {
        Ok(self
            .working
            .orders
            .values()
            .find(|o| o.payment_intent_id.as_deref() == Some(payment_intent_id))
            .cloned())
    }

    async fn update_order(
        &mut self,
        order: &Order,
        expected_version: i64,
    ) -> Result<bool, ServiceError> {
        match self.working.orders.get_mut(&order.id) {
            Some(current) if current.version == expected_version => {
                current.status = order.status;
                current.payment_intent_id = order.payment_intent_id.clone();
                current.payment_client_secret = order.payment_client_secret.clone();
                current.version = order.version;
                current.updated_at = order.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_orders_created_before(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let mut pending: Vec<&Order> = self
            .working
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::PendingPayment && o.created_at < cutoff)
            .collect();
        pending.sort_by_key(|o| o.created_at);
        Ok(pending
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|o| o.id)
            .collect())
    }
}

#[async_trait]
impl PaymentEventRepository for MemoryTx {
    async fn get_processed_event(
        &mut self,
        event_id: &str,
    ) -> Result<Option<ProcessedEvent>, ServiceError> {
        Ok(self.working.processed_events.get(event_id).cloned())
    }

    async fn insert_processed_event(
        &mut self,
        event: &ProcessedEvent,
    ) -> Result<bool, ServiceError> {
        if self.working.processed_events.contains_key(&event.event_id) {
            return Ok(false);
        }
        self.working
            .processed_events
            .insert(event.event_id.clone(), event.clone());
        Ok(true)
    }

    async fn record_orphan(&mut self, orphan: &OrphanEvent) -> Result<(), ServiceError> {
        self.working
            .orphan_events
            .entry(orphan.event.id.clone())
            .or_insert_with(|| orphan.clone());
        Ok(())
    }

    async fn orphans_for_intent(
        &mut self,
        payment_intent_id: &str,
    ) -> Result<Vec<OrphanEvent>, ServiceError> {
        let mut orphans: Vec<OrphanEvent> = self
            .working
            .orphan_events
            .values()
            .filter(|o| o.event.payment_intent_id == payment_intent_id)
            .cloned()
            .collect();
        orphans.sort_by_key(|o| o.recorded_at);
        Ok(orphans)
    }

    async fn delete_orphan(&mut self, event_id: &str) -> Result<(), ServiceError> {
        self.working.orphan_events.remove(event_id);
        Ok(())
    }
}

#[async_trait]
impl CommissionRepository for MemoryTx {
    async fn insert_commission(&mut self, commission: &Commission) -> Result<bool, ServiceError> {
        let key = (commission.order_id, commission.seller_id);
        if self.working.commissions.contains_key(&key) {
            return Ok(false);
        }
        self.working.commissions.insert(key, commission.clone());
        Ok(true)
    }

    async fn commissions_for_order(
        &mut self,
        order_id: Uuid,
    ) -> Result<Vec<Commission>, ServiceError> {
        let mut found: Vec<Commission> = self
            .working
            .commissions
            .values()
            .filter(|c| c.order_id == order_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.seller_id);
        Ok(found)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(self: Box<Self>) -> Result<(), ServiceError> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(product_id: Uuid, available: i64) -> StockLevel {
        StockLevel {
            product_id,
            available,
            reserved: 0,
            version: 0,
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let store = InMemoryStore::new();
        let product = Uuid::new_v4();

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_stock(&level(product, 5)).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_stock(product).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_version_loses_compare_and_swap() {
        let store = InMemoryStore::new();
        let product = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        tx.insert_stock(&level(product, 5)).await.unwrap();
        let mut updated = level(product, 5);
        updated.reserved = 1;
        assert!(tx.compare_and_swap_stock(&updated, 0).await.unwrap());
        assert!(!tx.compare_and_swap_stock(&updated, 0).await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let stored = tx.get_stock(product).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.reserved, 1);
    }
}
