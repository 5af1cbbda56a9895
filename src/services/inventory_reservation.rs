//! Inventory Reservation Manager
//!
//! The only writer of the product stock ledger. Every ledger change is a
//! version-checked update, retried a bounded number of times when another
//! writer got there first.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{Availability, Reservation, ReservationStatus, StockLevel};
use crate::store::{Store, StoreTx};

const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub product_id: Uuid,
    pub quantity: i64,
}

#[derive(Clone)]
pub struct InventoryReservationManager {
    store: Arc<dyn Store>,
    max_cas_attempts: u32,
}

impl InventoryReservationManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
        }
    }

    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    /// Reads the ledger row, lets `apply` change it and writes it back with a
    /// version check, re-reading on a lost race.
    async fn update_ledger<F>(
        &self,
        tx: &mut dyn StoreTx,
        product_id: Uuid,
        mut apply: F,
    ) -> Result<StockLevel, ServiceError>
    where
        F: FnMut(&mut StockLevel) -> Result<(), ServiceError> + Send,
    {
        for attempt in 1..=self.max_cas_attempts {
            let current = tx
                .get_stock(product_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("No stock for product {product_id}")))?;

            let mut next = current.clone();
            apply(&mut next)?;
            if !next.is_consistent() {
                return Err(ServiceError::InternalError(format!(
                    "ledger update for product {product_id} would break reserved <= available"
                )));
            }

            if tx.compare_and_swap_stock(&next, current.version).await? {
                next.version = current.version + 1;
                return Ok(next);
            }
            debug!(%product_id, attempt, "stock ledger version conflict, retrying");
        }

        counter!("checkout.inventory.cas_exhausted", 1);
        Err(ServiceError::ConcurrentModification(product_id))
    }

    /// Reserves every requested quantity for `order_id`, or nothing.
    ///
    /// Lines for the same product are added together. When any product is
    /// short, reservations made earlier in this call are undone and the
    /// error names every short product.
    #[instrument(skip(self, tx, requests), fields(order_id = %order_id))]
    pub async fn reserve(
        &self,
        tx: &mut dyn StoreTx,
        order_id: Uuid,
        requests: &[ReservationRequest],
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, ServiceError> {
        let mut wanted: BTreeMap<Uuid, i64> = BTreeMap::new();
        for request in requests {
            if request.quantity <= 0 {
                return Err(ServiceError::InvalidQuantity(format!(
                    "cannot reserve {} of product {}",
                    request.quantity, request.product_id
                )));
            }
            *wanted.entry(request.product_id).or_default() += request.quantity;
        }

        let mut taken: Vec<(Uuid, i64)> = Vec::new();
        let mut short: Vec<Uuid> = Vec::new();

        for (&product_id, &quantity) in &wanted {
            let result = self
                .update_ledger(tx, product_id, |level| {
                    if level.sellable() < quantity {
                        return Err(ServiceError::InsufficientStock(vec![product_id]));
                    }
                    level.reserved += quantity;
                    Ok(())
                })
                .await;

            match result {
                Ok(_) => taken.push((product_id, quantity)),
                Err(ServiceError::InsufficientStock(_)) | Err(ServiceError::NotFound(_)) => {
                    short.push(product_id)
                }
                Err(other) => {
                    self.compensate(tx, &taken).await?;
                    return Err(other);
                }
            }
        }

        if !short.is_empty() {
            self.compensate(tx, &taken).await?;
            counter!("checkout.reservations.rejected", 1);
            warn!(%order_id, short = ?short, "reservation rejected for insufficient stock");
            return Err(ServiceError::InsufficientStock(short));
        }

        let mut reservations = Vec::with_capacity(taken.len());
        for (product_id, quantity) in taken {
            let reservation = Reservation {
                id: Uuid::new_v4(),
                order_id,
                product_id,
                quantity,
                status: ReservationStatus::Held,
                expires_at,
                created_at: now,
                updated_at: now,
            };
            tx.insert_reservation(&reservation).await?;
            reservations.push(reservation);
        }

        info!(%order_id, products = reservations.len(), "stock reserved");
        Ok(reservations)
    }

    async fn compensate(
        &self,
        tx: &mut dyn StoreTx,
        taken: &[(Uuid, i64)],
    ) -> Result<(), ServiceError> {
        for &(product_id, quantity) in taken {
            self.update_ledger(tx, product_id, |level| {
                level.reserved -= quantity;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Turns the order's held stock into a sale. Reservations that are no
    /// longer held are skipped, so repeating the call changes nothing.
    #[instrument(skip(self, tx), fields(order_id = %order_id))]
    pub async fn finalize(
        &self,
        tx: &mut dyn StoreTx,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<usize, ServiceError> {
        self.settle(tx, order_id, ReservationStatus::Finalized, now)
            .await
    }

    /// Returns the order's held stock to the sellable pool. Idempotent.
    #[instrument(skip(self, tx), fields(order_id = %order_id))]
    pub async fn release(
        &self,
        tx: &mut dyn StoreTx,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<usize, ServiceError> {
        self.settle(tx, order_id, ReservationStatus::Released, now)
            .await
    }

    async fn settle(
        &self,
        tx: &mut dyn StoreTx,
        order_id: Uuid,
        outcome: ReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<usize, ServiceError> {
        let mut settled = 0;
        for mut reservation in tx.reservations_for_order(order_id).await? {
            if reservation.status != ReservationStatus::Held {
                continue;
            }
            let quantity = reservation.quantity;
            self.update_ledger(tx, reservation.product_id, |level| {
                level.reserved -= quantity;
                if outcome == ReservationStatus::Finalized {
                    level.available -= quantity;
                }
                Ok(())
            })
            .await?;

            reservation.status = outcome;
            reservation.updated_at = now;
            tx.update_reservation(&reservation).await?;
            settled += 1;
        }

        if settled > 0 {
            info!(%order_id, reservations = settled, outcome = %outcome, "reservations settled");
        }
        Ok(settled)
    }

    /// Read-only view for the catalog.
    pub async fn availability(&self, product_id: Uuid) -> Result<Availability, ServiceError> {
        let mut tx = self.store.begin().await?;
        let level = tx
            .get_stock(product_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("No stock for product {product_id}")))?;
        Ok(Availability::from(level))
    }

    /// Adds `quantity` to the available stock, creating the ledger row on
    /// first use.
    #[instrument(skip(self))]
    pub async fn restock(&self, product_id: Uuid, quantity: i64) -> Result<StockLevel, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::InvalidQuantity(format!(
                "restock quantity must be positive, got {quantity}"
            )));
        }

        let mut tx = self.store.begin().await?;
        let level = match tx.get_stock(product_id).await? {
            None => {
                let level = StockLevel {
                    product_id,
                    available: quantity,
                    reserved: 0,
                    version: 0,
                };
                tx.insert_stock(&level).await?;
                level
            }
            Some(_) => {
                self.update_ledger(tx.as_mut(), product_id, |level| {
                    level.available = level.available.checked_add(quantity).ok_or_else(|| {
                        ServiceError::InvalidQuantity("available stock overflow".to_string())
                    })?;
                    Ok(())
                })
                .await?
            }
        };
        tx.commit().await?;

        info!(%product_id, available = level.available, "restocked");
        Ok(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use assert_matches::assert_matches;

    async fn manager_with_stock(stock: &[(Uuid, i64)]) -> InventoryReservationManager {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let manager = InventoryReservationManager::new(store);
        for &(product_id, quantity) in stock {
            manager.restock(product_id, quantity).await.unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn reserve_is_all_or_nothing() {
        let plenty = Uuid::new_v4();
        let scarce = Uuid::new_v4();
        let manager = manager_with_stock(&[(plenty, 10), (scarce, 1)]).await;
        let now = Utc::now();

        let mut tx = manager.store.begin().await.unwrap();
        let result = manager
            .reserve(
                tx.as_mut(),
                Uuid::new_v4(),
                &[
                    ReservationRequest {
                        product_id: plenty,
                        quantity: 3,
                    },
                    ReservationRequest {
                        product_id: scarce,
                        quantity: 2,
                    },
                ],
                now,
                now,
            )
            .await;
        assert_matches!(result, Err(ServiceError::InsufficientStock(ids)) if ids == vec![scarce]);
        tx.commit().await.unwrap();

        let plenty_level = manager.availability(plenty).await.unwrap();
        assert_eq!(plenty_level.reserved, 0);
        assert_eq!(plenty_level.sellable, 10);
    }

    #[tokio::test]
    async fn lines_for_same_product_are_aggregated() {
        let product = Uuid::new_v4();
        let manager = manager_with_stock(&[(product, 3)]).await;
        let now = Utc::now();

        let mut tx = manager.store.begin().await.unwrap();
        let result = manager
            .reserve(
                tx.as_mut(),
                Uuid::new_v4(),
                &[
                    ReservationRequest {
                        product_id: product,
                        quantity: 2,
                    },
                    ReservationRequest {
                        product_id: product,
                        quantity: 2,
                    },
                ],
                now,
                now,
            )
            .await;
        assert_matches!(result, Err(ServiceError::InsufficientStock(_)));
    }

    #[tokio::test]
    async fn finalize_and_release_are_idempotent() {
        let product = Uuid::new_v4();
        let manager = manager_with_stock(&[(product, 5)]).await;
        let now = Utc::now();
        let paid_order = Uuid::new_v4();
        let abandoned_order = Uuid::new_v4();

        let mut tx = manager.store.begin().await.unwrap();
        for order_id in [paid_order, abandoned_order] {
            manager
                .reserve(
                    tx.as_mut(),
                    order_id,
                    &[ReservationRequest {
                        product_id: product,
                        quantity: 2,
                    }],
                    now,
                    now,
                )
                .await
                .unwrap();
        }
        assert_eq!(manager.finalize(tx.as_mut(), paid_order, now).await.unwrap(), 1);
        assert_eq!(manager.finalize(tx.as_mut(), paid_order, now).await.unwrap(), 0);
        assert_eq!(manager.release(tx.as_mut(), abandoned_order, now).await.unwrap(), 1);
        assert_eq!(manager.release(tx.as_mut(), abandoned_order, now).await.unwrap(), 0);
        // A finalized reservation is never released afterwards.
        assert_eq!(manager.release(tx.as_mut(), paid_order, now).await.unwrap(), 0);
        tx.commit().await.unwrap();

        let level = manager.availability(product).await.unwrap();
        assert_eq!(level.available, 3);
        assert_eq!(level.reserved, 0);
    }

    #[tokio::test]
    async fn restock_rejects_non_positive_quantity() {
        let manager = manager_with_stock(&[]).await;
        assert_matches!(
            manager.restock(Uuid::new_v4(), 0).await,
            Err(ServiceError::InvalidQuantity(_))
        );
    }
}
