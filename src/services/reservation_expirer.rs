//! Background sweep that cancels orders whose payment never arrived and
//! returns their stock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::inventory_reservation::InventoryReservationManager;
use super::locks::KeyedLocks;
use super::notifications::{NotificationDispatcher, NotificationKind};
use super::order_state::OrderStateMachine;
use super::payment_reconciler::PaymentReconciler;
use crate::errors::ServiceError;
use crate::models::{OrderStatus, TransitionTrigger};
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub cancelled: usize,
    /// Orders that settled between the scan and the lock.
    pub skipped: usize,
    pub failed: usize,
}

pub struct ReservationExpirer {
    store: Arc<dyn Store>,
    inventory: InventoryReservationManager,
    notifications: NotificationDispatcher,
    reconciler: Arc<PaymentReconciler>,
    order_locks: KeyedLocks<Uuid>,
    ttl: chrono::Duration,
    batch_size: u64,
}

impl ReservationExpirer {
    pub fn new(
        store: Arc<dyn Store>,
        inventory: InventoryReservationManager,
        notifications: NotificationDispatcher,
        reconciler: Arc<PaymentReconciler>,
        order_locks: KeyedLocks<Uuid>,
        ttl: Duration,
        batch_size: u64,
    ) -> Result<Self, ServiceError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| ServiceError::InternalError(format!("reservation ttl: {e}")))?;
        Ok(Self {
            store,
            inventory,
            notifications,
            reconciler,
            order_locks,
            ttl,
            batch_size: batch_size.max(1),
        })
    }

    /// Cancels up to one batch of `PENDING_PAYMENT` orders created more than
    /// one TTL before `now`. An order that fails is logged and left for the
    /// next sweep.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let cutoff = now - self.ttl;
        let mut tx = self.store.begin().await?;
        let candidates = tx
            .pending_orders_created_before(cutoff, self.batch_size)
            .await?;
        drop(tx);

        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };
        for order_id in candidates {
            match self.expire_order(order_id, now).await {
                Ok(true) => report.cancelled += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(%order_id, error = %e, "failed to expire order");
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                cancelled = report.cancelled,
                skipped = report.skipped,
                failed = report.failed,
                "expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Returns `false` when the order is no longer an expiry candidate once
    /// its lock is held (paid, failed or cancelled in the meantime).
    ///
    /// Orphaned events for the order's intent are replayed first. An event
    /// whose orphan row committed after the checkout's own redelivery scan
    /// would otherwise never reach the order.
    pub async fn expire_order(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut tx = self.store.begin().await?;
        let intent = tx
            .get_order(order_id)
            .await?
            .filter(|order| order.status == OrderStatus::PendingPayment)
            .and_then(|order| order.payment_intent_id);
        drop(tx);
        if let Some(intent) = intent {
            let replayed = self.reconciler.redeliver_orphans(&intent).await?;
            if !replayed.is_empty() {
                info!(%order_id, events = replayed.len(), "late orphaned events applied before expiry");
            }
        }

        let _guard = self.order_locks.lock(order_id).await;
        let mut tx = self.store.begin().await?;
        let Some(mut order) = tx.get_order(order_id).await? else {
            return Ok(false);
        };
        if order.status != OrderStatus::PendingPayment || order.created_at > now - self.ttl {
            debug!(%order_id, status = %order.status, "order settled before expiry");
            return Ok(false);
        }

        OrderStateMachine::transition(
            tx.as_mut(),
            &mut order,
            OrderStatus::Cancelled,
            TransitionTrigger::Expiry,
            now,
        )
        .await?;
        let released = self.inventory.release(tx.as_mut(), order_id, now).await?;
        tx.commit().await?;

        counter!("checkout.orders.expired", 1);
        info!(%order_id, released, "unpaid order expired");
        self.notifications
            .dispatch(order_id, NotificationKind::OrderCancelled);
        Ok(true)
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until `shutdown` flips
    /// to `true`.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep(Utc::now()).await {
                            warn!(error = %e, "expiry sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("reservation expirer stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
