//! A store that passes everything through to another store but can make
//! ledger swaps and dedup inserts lose to a simulated rival writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use marketplace_checkout::{
    errors::ServiceError,
    models::{
        Cart, Commission, Coupon, Order, OrphanEvent, ProcessedEvent, Reservation, StockLevel,
    },
    store::{
        CartRepository, CommissionRepository, CouponRepository, InMemoryStore, LedgerRepository,
        OrderRepository, PaymentEventRepository, Store, StoreTx,
    },
};

pub const RIVAL_DETAIL: &str = "recorded by another worker";

#[derive(Default)]
pub struct Interference {
    /// Units a rival reserves just before the next ledger swap, making it stale.
    pub rival_reserves: Mutex<Option<i64>>,
    /// Every ledger swap reports a lost race.
    pub always_stale: AtomicBool,
    /// The next dedup insert finds the event already recorded by a rival.
    pub lose_next_dedup: AtomicBool,
    swaps: AtomicU32,
    rival_records: Mutex<HashMap<String, ProcessedEvent>>,
}

impl Interference {
    pub fn swaps(&self) -> u32 {
        self.swaps.load(Ordering::SeqCst)
    }
}

pub struct InterceptedStore {
    inner: Arc<dyn Store>,
    pub interference: Arc<Interference>,
}

impl InterceptedStore {
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(InMemoryStore::new()),
            interference: Arc::new(Interference::default()),
        })
    }
}

#[async_trait]
impl Store for InterceptedStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, ServiceError> {
        Ok(Box::new(InterceptedTx {
            inner: self.inner.begin().await?,
            interference: self.interference.clone(),
        }))
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        self.inner.health_check().await
    }
}

struct InterceptedTx {
    inner: Box<dyn StoreTx>,
    interference: Arc<Interference>,
}

#[async_trait]
impl LedgerRepository for InterceptedTx {
    async fn get_stock(&mut self, product_id: Uuid) -> Result<Option<StockLevel>, ServiceError> {
        self.inner.get_stock(product_id).await
    }

    async fn insert_stock(&mut self, level: &StockLevel) -> Result<(), ServiceError> {
        self.inner.insert_stock(level).await
    }

    async fn compare_and_swap_stock(
        &mut self,
        level: &StockLevel,
        expected_version: i64,
    ) -> Result<bool, ServiceError> {
        self.interference.swaps.fetch_add(1, Ordering::SeqCst);
        if self.interference.always_stale.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let rival_units = self.interference.rival_reserves.lock().unwrap().take();
        if let Some(units) = rival_units {
            let mut rival = self
                .inner
                .get_stock(level.product_id)
                .await?
                .expect("ledger row exists");
            let version = rival.version;
            rival.reserved += units;
            assert!(self.inner.compare_and_swap_stock(&rival, version).await?);
        }
        self.inner.compare_and_swap_stock(level, expected_version).await
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), ServiceError> {
        self.inner.insert_reservation(reservation).await
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<(), ServiceError> {
        self.inner.update_reservation(reservation).await
    }

    async fn reservations_for_order(
        &mut self,
        order_id: Uuid,
    ) -> Result<Vec<Reservation>, ServiceError> {
        self.inner.reservations_for_order(order_id).await
    }
}

#[async_trait]
impl PaymentEventRepository for InterceptedTx {
    async fn get_processed_event(
        &mut self,
        event_id: &str,
    ) -> Result<Option<ProcessedEvent>, ServiceError> {
        let rival = self
            .interference
            .rival_records
            .lock()
            .unwrap()
            .get(event_id)
            .cloned();
        match rival {
            Some(record) => Ok(Some(record)),
            None => self.inner.get_processed_event(event_id).await,
        }
    }

    async fn insert_processed_event(
        &mut self,
        event: &ProcessedEvent,
    ) -> Result<bool, ServiceError> {
        if self.interference.lose_next_dedup.swap(false, Ordering::SeqCst) {
            let mut rival = event.clone();
            rival.outcome.detail = Some(RIVAL_DETAIL.to_string());
            self.interference
                .rival_records
                .lock()
                .unwrap()
                .insert(event.event_id.clone(), rival);
            return Ok(false);
        }
        self.inner.insert_processed_event(event).await
    }

    async fn record_orphan(&mut self, orphan: &OrphanEvent) -> Result<(), ServiceError> {
        self.inner.record_orphan(orphan).await
    }

    async fn orphans_for_intent(
        &mut self,
        payment_intent_id: &str,
    ) -> Result<Vec<OrphanEvent>, ServiceError> {
        self.inner.orphans_for_intent(payment_intent_id).await
    }

    async fn delete_orphan(&mut self, event_id: &str) -> Result<(), ServiceError> {
        self.inner.delete_orphan(event_id).await
    }
}

#[async_trait]
impl CartRepository for InterceptedTx {
    async fn get_cart(&mut self, id: Uuid) -> Result<Option<Cart>, ServiceError> {
        self.inner.get_cart(id).await
    }

    async fn save_cart(&mut self, cart: &Cart) -> Result<(), ServiceError> {
        self.inner.save_cart(cart).await
    }

    async fn delete_cart(&mut self, id: Uuid) -> Result<bool, ServiceError> {
        self.inner.delete_cart(id).await
    }
}

#[async_trait]
impl CouponRepository for InterceptedTx {
    async fn get_coupon(&mut self, code: &str) -> Result<Option<Coupon>, ServiceError> {
        self.inner.get_coupon(code).await
    }

    async fn save_coupon(&mut self, coupon: &Coupon) -> Result<(), ServiceError> {
        self.inner.save_coupon(coupon).await
    }

    async fn increment_coupon_usage(
        &mut self,
        code: &str,
    ) -> Result<Option<Coupon>, ServiceError> {
        self.inner.increment_coupon_usage(code).await
    }
}

#[async_trait]
impl OrderRepository for InterceptedTx {
    async fn insert_order(&mut self, order: &Order) -> Result<(), ServiceError> {
        self.inner.insert_order(order).await
    }

    async fn get_order(&mut self, id: Uuid) -> Result<Option<Order>, ServiceError> {
        self.inner.get_order(id).await
    }

    async fn find_order_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> Result<Option<Order>, ServiceError> {
        self.inner.find_order_by_idempotency_key(key).await
    }

    async fn find_order_by_payment_intent(
        &mut self,
        payment_intent_id: &str,
    ) -> Result<Option<Order>, ServiceError> {
        self.inner.find_order_by_payment_intent(payment_intent_id).await
    }

    async fn update_order(
        &mut self,
        order: &Order,
        expected_version: i64,
    ) -> Result<bool, ServiceError> {
        self.inner.update_order(order, expected_version).await
    }

    async fn pending_orders_created_before(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError> {
        self.inner.pending_orders_created_before(cutoff, limit).await
    }
}

#[async_trait]
impl CommissionRepository for InterceptedTx {
    async fn insert_commission(&mut self, commission: &Commission) -> Result<bool, ServiceError> {
        self.inner.insert_commission(commission).await
    }

    async fn commissions_for_order(
        &mut self,
        order_id: Uuid,
    ) -> Result<Vec<Commission>, ServiceError> {
        self.inner.commissions_for_order(order_id).await
    }
}

#[async_trait]
impl StoreTx for InterceptedTx {
    async fn commit(self: Box<Self>) -> Result<(), ServiceError> {
        self.inner.commit().await
    }
}
