//! The relational store against a throwaway SQLite file: the same checkout
//! and reconciliation paths the in-memory tests cover.

mod common;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::Utc;
use common::{payment_event, test_config, TestHarness};
use marketplace_checkout::{
    db::{self, DbConfig},
    errors::ServiceError,
    models::{
        Cart, Coupon, CouponScope, DiscountKind, Disposition, OrderStatus, PaymentEventKind,
        ProcessedEvent, ReconciliationOutcome, StockLevel,
    },
    services::{coupons::consume_coupon, inventory_reservation::ReservationRequest},
    store::{DatabaseStore, Store},
};
use tempfile::TempDir;
use uuid::Uuid;

async fn open_store(path: &Path) -> Arc<dyn Store> {
    let pool = db::establish_connection_with_config(&DbConfig {
        url: format!("sqlite://{}?mode=rwc", path.display()),
        max_connections: 4,
        ..DbConfig::default()
    })
    .await
    .expect("connect sqlite");
    db::create_schema(&pool).await.expect("create schema");
    Arc::new(DatabaseStore::new(pool))
}

async fn sqlite_store() -> (TempDir, Arc<dyn Store>) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("checkout.db");
    let store = open_store(&path).await;
    // Running it twice is harmless.
    let again = open_store(&path).await;
    drop(again);
    (dir, store)
}

/// Two independent handles on one database file, each with its own pool,
/// so nothing in-process serializes their transactions.
async fn two_handles() -> (TempDir, Arc<dyn Store>, Arc<dyn Store>) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("shared.db");
    let first = open_store(&path).await;
    let second = open_store(&path).await;
    (dir, first, second)
}

/// SQLite answers a write that collides with another connection with a busy
/// error; the caller retries, as a gateway redelivers after a 503.
async fn retry_busy<T, F, Fut>(mut attempt: F) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    for _ in 0..100 {
        match attempt().await {
            Err(ServiceError::DatabaseError(_)) => {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await
            }
            other => return other,
        }
    }
    attempt().await
}

#[tokio::test]
async fn ledger_compare_and_swap_checks_the_version() {
    let (_dir, store) = sqlite_store().await;
    let product_id = Uuid::new_v4();

    let mut tx = store.begin().await.unwrap();
    tx.insert_stock(&StockLevel {
        product_id,
        available: 5,
        reserved: 0,
        version: 0,
    })
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let next = StockLevel {
        product_id,
        available: 5,
        reserved: 2,
        version: 0,
    };
    assert!(tx.compare_and_swap_stock(&next, 0).await.unwrap());
    // The version moved on; a stale writer loses.
    assert!(!tx.compare_and_swap_stock(&next, 0).await.unwrap());
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let level = tx.get_stock(product_id).await.unwrap().unwrap();
    assert_eq!((level.reserved, level.version), (2, 1));
}

#[tokio::test]
async fn uncommitted_work_is_rolled_back() {
    let (_dir, store) = sqlite_store().await;
    let cart = Cart::new("buyer-rollback", Utc::now());

    let mut tx = store.begin().await.unwrap();
    tx.save_cart(&cart).await.unwrap();
    drop(tx);

    let mut tx = store.begin().await.unwrap();
    assert!(tx.get_cart(cart.id).await.unwrap().is_none());
}

#[tokio::test]
async fn checkout_and_payment_on_sqlite() {
    let (_dir, store) = sqlite_store().await;
    let harness = TestHarness::with_store(test_config(), store);
    let product = harness.seed_product(10_000, 5).await;
    let cart = harness.cart_with("buyer-sql", &[(product.product_id, 2)]).await;

    let first = harness.checkout("buyer-sql", cart.id, None).await.unwrap();
    assert_eq!(first.order.totals.grand_total, 24_100);
    let replay = harness.checkout("buyer-sql", cart.id, None).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.order.id, first.order.id);

    let stored = harness.order(first.order.id).await;
    assert_eq!(stored.lines, first.order.lines);
    assert_eq!(stored.totals, first.order.totals);
    assert_eq!(stored.seller_commissions, first.order.seller_commissions);

    let intent = stored.payment_intent_id.clone().unwrap();
    let event = payment_event("evt_sql", PaymentEventKind::Succeeded, &intent);
    let outcome = harness.state.reconciler.handle_event(event.clone()).await.unwrap();
    assert_eq!(outcome.disposition, Disposition::Applied);
    let again = harness.state.reconciler.handle_event(event).await.unwrap();
    assert!(again.replayed);

    assert_eq!(harness.order(first.order.id).await.status, OrderStatus::Paid);
    let stock = harness.stock(product.product_id).await;
    assert_eq!((stock.available, stock.reserved), (3, 0));
    assert_eq!(harness.commissions(first.order.id).await.len(), 1);
}

#[tokio::test]
async fn orphans_and_expiry_on_sqlite() {
    let (_dir, store) = sqlite_store().await;
    let harness = TestHarness::with_store(test_config(), store);
    let product = harness.seed_product(1_000, 3).await;

    assert_matches!(
        harness
            .state
            .reconciler
            .handle_event(payment_event("evt_lost", PaymentEventKind::Failed, "pi_lost"))
            .await,
        Err(ServiceError::OrphanEvent { .. })
    );

    let cart = harness.cart_with("buyer-exp", &[(product.product_id, 3)]).await;
    let order = harness.checkout("buyer-exp", cart.id, None).await.unwrap().order;

    let ttl = chrono::Duration::seconds(harness.state.config.reservation_ttl_secs as i64 + 1);
    let report = harness.state.expirer.sweep(Utc::now() + ttl).await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(harness.order(order.id).await.status, OrderStatus::Cancelled);
    assert_eq!(harness.stock(product.product_id).await.reserved, 0);

    let mut tx = harness.store.begin().await.unwrap();
    assert_eq!(tx.orphans_for_intent("pi_lost").await.unwrap().len(), 1);
}

#[tokio::test]
async fn processed_event_insert_keeps_the_first_record() {
    let (_dir, store) = sqlite_store().await;
    let record = |detail: &str| ProcessedEvent {
        event_id: "evt_dup".to_string(),
        kind: PaymentEventKind::Succeeded,
        payment_intent_id: "pi_dup".to_string(),
        payload: serde_json::json!({ "id": "evt_dup" }),
        outcome: ReconciliationOutcome {
            event_id: "evt_dup".to_string(),
            order_id: Uuid::nil(),
            disposition: Disposition::Applied,
            order_status: OrderStatus::Paid,
            detail: Some(detail.to_string()),
            replayed: false,
        },
        processed_at: Utc::now(),
    };

    let mut tx = store.begin().await.unwrap();
    assert!(tx.insert_processed_event(&record("first")).await.unwrap());
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert!(!tx.insert_processed_event(&record("second")).await.unwrap());
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let stored = tx.get_processed_event("evt_dup").await.unwrap().unwrap();
    assert_eq!(stored.outcome.detail.as_deref(), Some("first"));
}

#[tokio::test]
async fn redefining_a_coupon_keeps_usage_on_sqlite() {
    let (_dir, store) = sqlite_store().await;
    let coupon = Coupon {
        code: "SQL10".to_string(),
        discount: DiscountKind::FixedAmount { amount: 1_000 },
        scope: CouponScope::default(),
        min_subtotal: None,
        starts_at: None,
        expires_at: None,
        usage_limit: Some(5),
        usage_count: 0,
    };

    let mut tx = store.begin().await.unwrap();
    tx.save_coupon(&coupon).await.unwrap();
    consume_coupon(tx.as_mut(), "SQL10").await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.save_coupon(&Coupon {
        usage_limit: Some(9),
        ..coupon
    })
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let stored = tx.get_coupon("SQL10").await.unwrap().unwrap();
    assert_eq!((stored.usage_limit, stored.usage_count), (Some(9), 1));
}

#[tokio::test]
async fn same_event_on_two_handles_is_applied_once() {
    let (_dir, first, second) = two_handles().await;
    let a = TestHarness::with_store(test_config(), first);
    let b = TestHarness::with_store(test_config(), second);
    let product = a.seed_product(10_000, 5).await;
    let cart = a.cart_with("buyer-two", &[(product.product_id, 2)]).await;
    let order = a.checkout("buyer-two", cart.id, None).await.unwrap().order;
    let event = payment_event(
        "evt_two_handles",
        PaymentEventKind::Succeeded,
        order.payment_intent_id.as_deref().unwrap(),
    );

    let (left, right) = tokio::join!(
        retry_busy(|| a.state.reconciler.handle_event(event.clone())),
        retry_busy(|| b.state.reconciler.handle_event(event.clone())),
    );
    let outcomes = [left.unwrap(), right.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| !o.replayed).count(), 1);
    assert!(outcomes
        .iter()
        .all(|o| o.disposition == Disposition::Applied && o.order_status == OrderStatus::Paid));

    let stock = b.stock(product.product_id).await;
    assert_eq!((stock.available, stock.reserved), (3, 0));
    assert_eq!(b.commissions(order.id).await.len(), 1);
    assert_eq!(b.order(order.id).await.version, order.version + 1);
}

#[tokio::test]
async fn last_unit_on_two_handles_goes_to_one_reservation() {
    let (_dir, first, second) = two_handles().await;
    let a = TestHarness::with_store(test_config(), first.clone());
    let b = TestHarness::with_store(test_config(), second.clone());
    let product = a.seed_product(1_000, 1).await;
    let now = Utc::now();
    let expires_at = now + chrono::Duration::minutes(30);
    let wanted = [ReservationRequest {
        product_id: product.product_id,
        quantity: 1,
    }];

    let reserve = |harness: &TestHarness, store: Arc<dyn Store>| {
        let inventory = harness.state.inventory.clone();
        let wanted = wanted;
        async move {
            retry_busy(|| {
                let inventory = inventory.clone();
                let store = store.clone();
                async move {
                    let mut tx = store.begin().await?;
                    let held = inventory
                        .reserve(tx.as_mut(), Uuid::new_v4(), &wanted, expires_at, now)
                        .await?;
                    tx.commit().await?;
                    Ok::<_, ServiceError>(held)
                }
            })
            .await
        }
    };

    let (left, right) = tokio::join!(reserve(&a, first), reserve(&b, second));
    let results = [left, right];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ServiceError::InsufficientStock(_)))));

    let stock = a.stock(product.product_id).await;
    assert_eq!((stock.available, stock.reserved), (1, 1));
}
