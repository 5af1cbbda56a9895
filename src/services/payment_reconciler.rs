//! Payment Reconciler
//!
//! Applies verified gateway events to orders exactly once. The dedup record
//! is written in the same transaction as the order transition, the ledger
//! update and the commission records, so an event is either fully applied
//! and marked processed, or neither.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::coupons::consume_coupon;
use super::inventory_reservation::InventoryReservationManager;
use super::locks::KeyedLocks;
use super::notifications::{NotificationDispatcher, NotificationKind};
use super::order_state::OrderStateMachine;
use crate::errors::ServiceError;
use crate::models::{
    Commission, Disposition, Order, OrderStatus, OrphanEvent, PaymentEvent, PaymentEventKind,
    ProcessedEvent, ReconciliationOutcome, TransitionTrigger,
};
use crate::store::{Store, StoreTx};

pub struct PaymentReconciler {
    store: Arc<dyn Store>,
    inventory: InventoryReservationManager,
    notifications: NotificationDispatcher,
    order_locks: KeyedLocks<Uuid>,
}

impl PaymentReconciler {
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

    /// Handles one gateway event.
    ///
    /// A repeated event id returns the stored outcome with `replayed` set.
    /// An event for an unknown intent is kept in the orphan log and reported
    /// as `OrphanEvent`.
    #[instrument(skip(self, event), fields(event_id = %event.id, kind = %event.kind, payment_intent_id = %event.payment_intent_id))]
    pub async fn handle_event(
        &self,
        event: PaymentEvent,
    ) -> Result<ReconciliationOutcome, ServiceError> {
        let mut tx = self.store.begin().await?;
        if let Some(processed) = tx.get_processed_event(&event.id).await? {
            counter!("checkout.payment_events.replayed", 1);
            info!("payment event already processed, returning stored outcome");
            return Ok(processed.outcome.as_replay());
        }

        let order_id = match tx.find_order_by_payment_intent(&event.payment_intent_id).await? {
            Some(order) => order.id,
            None => {
                tx.record_orphan(&OrphanEvent {
                    event: event.clone(),
                    recorded_at: Utc::now(),
                })
                .await?;
                tx.commit().await?;
                counter!("checkout.payment_events.orphaned", 1);
                warn!("payment event matches no order; kept for redelivery");
                return Err(ServiceError::OrphanEvent {
                    event_id: event.id,
                    payment_intent_id: event.payment_intent_id,
                });
            }
        };
        drop(tx);

        let _guard = self.order_locks.lock(order_id).await;
        let mut tx = self.store.begin().await?;

        // A concurrent delivery of the same event may have won the lock.
        if let Some(processed) = tx.get_processed_event(&event.id).await? {
            counter!("checkout.payment_events.replayed", 1);
            return Ok(processed.outcome.as_replay());
        }

        let mut order = tx
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

        let now = Utc::now();
        let (disposition, detail, notification) =
            self.apply(tx.as_mut(), &mut order, &event, now).await?;

        let outcome = ReconciliationOutcome {
            event_id: event.id.clone(),
            order_id,
            disposition,
            order_status: order.status,
            detail,
            replayed: false,
        };

        let recorded = tx
            .insert_processed_event(&ProcessedEvent {
                event_id: event.id.clone(),
                kind: event.kind,
                payment_intent_id: event.payment_intent_id.clone(),
                payload: event.payload.clone(),
                outcome: outcome.clone(),
                processed_at: now,
            })
            .await?;
        if !recorded {
            // Another process recorded it between our check and insert;
            // discard our work and answer with theirs.
            drop(tx);
            let mut tx = self.store.begin().await?;
            let stored = tx.get_processed_event(&event.id).await?.ok_or_else(|| {
                ServiceError::InternalError(format!("dedup record for {} vanished", event.id))
            })?;
            return Ok(stored.outcome.as_replay());
        }
        tx.delete_orphan(&event.id).await?;
        tx.commit().await?;

        counter!("checkout.payment_events.processed", 1, "disposition" => disposition.to_string());
        if let Some(kind) = notification {
            self.notifications.dispatch(order_id, kind);
        }
        Ok(outcome)
    }

    async fn apply(
        &self,
        tx: &mut dyn StoreTx,
        order: &mut Order,
        event: &PaymentEvent,
        now: chrono::DateTime<Utc>,
    ) -> Result<(Disposition, Option<String>, Option<NotificationKind>), ServiceError> {
        if order.status.is_terminal() {
            if event.kind == PaymentEventKind::Succeeded && order.status == OrderStatus::Cancelled
            {
                warn!(
                    order_id = %order.id,
                    "payment succeeded for a cancelled order; manual refund required"
                );
            } else {
                info!(order_id = %order.id, status = %order.status, "order already terminal");
            }
            return Ok((
                Disposition::NoOp,
                Some(format!("order already {}", order.status)),
                None,
            ));
        }

        // A second success notice for an order already paid (a sibling event
        // under another id) confirms what was applied.
        if event.kind == PaymentEventKind::Succeeded
            && matches!(
                order.status,
                OrderStatus::Paid | OrderStatus::Fulfilling | OrderStatus::Shipped
            )
        {
            info!(order_id = %order.id, status = %order.status, "payment already applied");
            return Ok((
                Disposition::NoOp,
                Some(format!("order already {}", order.status)),
                None,
            ));
        }

        let (target, trigger) = match event.kind {
            PaymentEventKind::Succeeded => (OrderStatus::Paid, TransitionTrigger::PaymentSucceeded),
            PaymentEventKind::Failed => {
                (OrderStatus::PaymentFailed, TransitionTrigger::PaymentFailed)
            }
            PaymentEventKind::Refunded => (OrderStatus::Refunded, TransitionTrigger::Refund),
        };

        if let Err(ServiceError::InvalidTransition { from, to, .. }) =
            OrderStateMachine::ensure_transition(order, target)
        {
            error!(
                order_id = %order.id,
                event_id = %event.id,
                event_kind = %event.kind,
                payment_intent_id = %event.payment_intent_id,
                from = %from,
                to = %to,
                payload = %event.payload,
                "payment event rejected by the order state machine"
            );
            return Ok((
                Disposition::Rejected,
                Some(format!("{from} cannot move to {to}")),
                None,
            ));
        }

        OrderStateMachine::transition(tx, order, target, trigger, now).await?;

        let notification = match event.kind {
            PaymentEventKind::Succeeded => {
                self.inventory.finalize(tx, order.id, now).await?;
                if let Some(code) = &order.coupon_code {
                    consume_coupon(tx, code).await?;
                }
                for share in &order.seller_commissions {
                    tx.insert_commission(&Commission {
                        order_id: order.id,
                        seller_id: share.seller_id,
                        amount: share.amount,
                        created_at: now,
                    })
                    .await?;
                }
                NotificationKind::PaymentSucceeded
            }
            PaymentEventKind::Failed => {
                self.inventory.release(tx, order.id, now).await?;
                NotificationKind::PaymentFailed
            }
            PaymentEventKind::Refunded => NotificationKind::OrderRefunded,
        };

        Ok((Disposition::Applied, None, Some(notification)))
    }

    /// Re-runs events that arrived before their intent reference was stored
    /// on an order. Events that still match nothing stay in the orphan log.
    #[instrument(skip(self))]
    pub async fn redeliver_orphans(
        &self,
        payment_intent_id: &str,
    ) -> Result<Vec<ReconciliationOutcome>, ServiceError> {
        let mut tx = self.store.begin().await?;
        let orphans = tx.orphans_for_intent(payment_intent_id).await?;
        drop(tx);

        let mut outcomes = Vec::with_capacity(orphans.len());
        for orphan in orphans {
            let event_id = orphan.event.id.clone();
            match self.handle_event(orphan.event).await {
                Ok(outcome) => {
                    info!(%event_id, disposition = %outcome.disposition, "orphaned event redelivered");
                    outcomes.push(outcome);
                }
                Err(ServiceError::OrphanEvent { .. }) => {}
                Err(e) => warn!(%event_id, error = %e, "orphaned event redelivery failed"),
            }
        }
        Ok(outcomes)
    }
}
