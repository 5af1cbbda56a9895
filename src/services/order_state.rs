//! Order lifecycle enforcement.
//!
//! Every status change goes through [`OrderStateMachine::transition`], which
//! checks the transition table and persists the change as a compare-and-swap
//! on the order version.

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::errors::ServiceError;
use crate::models::{Order, OrderStatus, PaymentIntent, TransitionTrigger};
use crate::store::StoreTx;

pub struct OrderStateMachine;

impl OrderStateMachine {
    pub fn ensure_transition(order: &Order, next: OrderStatus) -> Result<(), ServiceError> {
        if order.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(ServiceError::InvalidTransition {
                order_id: order.id,
                from: order.status,
                to: next,
            })
        }
    }

    /// `DRAFT -> PENDING_PAYMENT`: the first write of a new order.
    pub async fn place(
        tx: &mut dyn StoreTx,
        order: &mut Order,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        Self::ensure_transition(order, OrderStatus::PendingPayment)?;
        order.status = OrderStatus::PendingPayment;
        order.version = 1;
        order.updated_at = now;
        tx.insert_order(order).await?;

        info!(
            order_id = %order.id,
            from = %OrderStatus::Draft,
            to = %order.status,
            trigger = %TransitionTrigger::Checkout,
            "order transitioned"
        );
        Ok(())
    }

    /// Moves `order` to `next` inside the caller's transaction. On success
    /// `order` reflects the stored row; on failure it is left untouched.
    pub async fn transition(
        tx: &mut dyn StoreTx,
        order: &mut Order,
        next: OrderStatus,
        trigger: TransitionTrigger,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        if let Err(err) = Self::ensure_transition(order, next) {
            error!(
                order_id = %order.id,
                from = %order.status,
                to = %next,
                trigger = %trigger,
                "illegal order transition refused"
            );
            return Err(err);
        }

        let mut updated = order.clone();
        updated.status = next;
        updated.version = order.version + 1;
        updated.updated_at = now;

        if !tx.update_order(&updated, order.version).await? {
            return Err(ServiceError::ConcurrentModification(order.id));
        }

        info!(
            order_id = %order.id,
            from = %order.status,
            to = %next,
            trigger = %trigger,
            version = updated.version,
            "order transitioned"
        );
        *order = updated;
        Ok(())
    }

    /// Stores the gateway's intent reference. The status is not touched; an
    /// order that already carries an intent keeps it.
    pub async fn attach_payment_intent(
        tx: &mut dyn StoreTx,
        order: &mut Order,
        intent: &PaymentIntent,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        if order.payment_intent_id.is_some() {
            return Ok(());
        }

        let mut updated = order.clone();
        updated.payment_intent_id = Some(intent.id.clone());
        updated.payment_client_secret = Some(intent.client_secret.clone());
        updated.version = order.version + 1;
        updated.updated_at = now;

        if !tx.update_order(&updated, order.version).await? {
            return Err(ServiceError::ConcurrentModification(order.id));
        }
        info!(order_id = %order.id, payment_intent_id = %intent.id, "payment intent attached");
        *order = updated;
        Ok(())
    }
}
