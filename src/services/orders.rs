use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::{info, instrument};
use uuid::Uuid;

use super::inventory_reservation::InventoryReservationManager;
use super::locks::KeyedLocks;
use super::notifications::{NotificationDispatcher, NotificationKind};
use super::order_state::OrderStateMachine;
use crate::errors::ServiceError;
use crate::models::{Commission, Order, OrderStatus, TransitionTrigger};
use crate::store::Store;

/// Buyer- and seller-facing order operations outside of checkout and
/// payment reconciliation.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn Store>,
    inventory: InventoryReservationManager,
    notifications: NotificationDispatcher,
    order_locks: KeyedLocks<Uuid>,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn Store>,
        inventory: InventoryReservationManager,
        notifications: NotificationDispatcher,
        order_locks: KeyedLocks<Uuid>,
    ) -> Self {
        Self {
            store,
            inventory,
            notifications,
            order_locks,
        }
    }

    /// Fetches an order. Other buyers' orders are reported as missing.
    pub async fn get_order(&self, order_id: Uuid, buyer_id: &str) -> Result<Order, ServiceError> {
        let mut tx = self.store.begin().await?;
        let order = tx
            .get_order(order_id)
            .await?
            .filter(|order| order.buyer_id == buyer_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;
        Ok(order)
    }

    /// Buyer cancellation of an unpaid order; the held stock goes back to
    /// the pool.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: Uuid, buyer_id: &str) -> Result<Order, ServiceError> {
        let _guard = self.order_locks.lock(order_id).await;
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut order = tx
            .get_order(order_id)
            .await?
            .filter(|order| order.buyer_id == buyer_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

        OrderStateMachine::transition(
            tx.as_mut(),
            &mut order,
            OrderStatus::Cancelled,
            TransitionTrigger::BuyerCancellation,
            now,
        )
        .await?;
        self.inventory.release(tx.as_mut(), order_id, now).await?;
        tx.commit().await?;

        counter!("checkout.orders.cancelled", 1);
        info!(%order_id, "order cancelled by buyer");
        self.notifications
            .dispatch(order_id, NotificationKind::OrderCancelled);
        Ok(order)
    }

    /// Moves a paid order along `PAID -> FULFILLING -> SHIPPED -> DELIVERED`.
    #[instrument(skip(self))]
    pub async fn advance_fulfillment(
        &self,
        order_id: Uuid,
        target: OrderStatus,
    ) -> Result<Order, ServiceError> {
        let kind = match target {
            OrderStatus::Fulfilling => NotificationKind::OrderFulfilling,
            OrderStatus::Shipped => NotificationKind::OrderShipped,
            OrderStatus::Delivered => NotificationKind::OrderDelivered,
            other => {
                return Err(ServiceError::ValidationError(format!(
                    "{other} is not a fulfillment status"
                )))
            }
        };

        let _guard = self.order_locks.lock(order_id).await;
        let mut tx = self.store.begin().await?;
        let mut order = tx
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

        OrderStateMachine::transition(
            tx.as_mut(),
            &mut order,
            target,
            TransitionTrigger::Fulfillment,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;

        self.notifications.dispatch(order_id, kind);
        Ok(order)
    }

    pub async fn commissions(&self, order_id: Uuid) -> Result<Vec<Commission>, ServiceError> {
        let mut tx = self.store.begin().await?;
        let commissions = tx.commissions_for_order(order_id).await?;
        Ok(commissions)
    }
}
