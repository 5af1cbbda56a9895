//! The stock ledger never oversells, whatever the interleaving.

mod common;

use std::sync::Arc;

use std::sync::atomic::Ordering;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::{intercept::InterceptedStore, TestHarness};
use marketplace_checkout::{
    errors::ServiceError,
    services::inventory_reservation::{InventoryReservationManager, ReservationRequest},
    store::Store,
};
use uuid::Uuid;

#[tokio::test]
async fn last_unit_goes_to_exactly_one_buyer() {
    let harness = Arc::new(TestHarness::new());
    let product = harness.seed_product(10_000, 1).await;
    let first = harness.cart_with("buyer-1", &[(product.product_id, 1)]).await;
    let second = harness.cart_with("buyer-2", &[(product.product_id, 1)]).await;

    let a = {
        let harness = harness.clone();
        tokio::spawn(async move { harness.checkout("buyer-1", first.id, None).await })
    };
    let b = {
        let harness = harness.clone();
        tokio::spawn(async move { harness.checkout("buyer-2", second.id, None).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ServiceError::InsufficientStock(ids)) if ids == &vec![product.product_id])));

    let stock = harness.stock(product.product_id).await;
    assert_eq!((stock.available, stock.reserved), (1, 1));
}

#[tokio::test]
async fn concurrent_reservations_never_exceed_stock() {
    let harness = Arc::new(TestHarness::new());
    let product = harness.seed_product(1_000, 10).await;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let harness = harness.clone();
        let product_id = product.product_id;
        tasks.push(tokio::spawn(async move {
            let now = Utc::now();
            let mut tx = harness.store.begin().await?;
            harness
                .state
                .inventory
                .reserve(
                    tx.as_mut(),
                    Uuid::new_v4(),
                    &[ReservationRequest {
                        product_id,
                        quantity: 1,
                    }],
                    now + Duration::minutes(30),
                    now,
                )
                .await?;
            tx.commit().await
        }));
    }

    let mut granted = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => granted += 1,
            Err(ServiceError::InsufficientStock(_)) => refused += 1,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!((granted, refused), (10, 10));

    let stock = harness.stock(product.product_id).await;
    assert_eq!((stock.available, stock.reserved), (10, 10));
    assert_eq!(
        harness
            .state
            .inventory
            .availability(product.product_id)
            .await
            .unwrap()
            .sellable,
        0
    );
}

#[tokio::test]
async fn one_short_product_reserves_nothing() {
    let harness = TestHarness::new();
    let plenty = harness.seed_product(1_000, 5).await;
    let scarce = harness.seed_product(1_000, 1).await;
    let now = Utc::now();

    let mut tx = harness.store.begin().await.unwrap();
    let err = harness
        .state
        .inventory
        .reserve(
            tx.as_mut(),
            Uuid::new_v4(),
            &[
                ReservationRequest {
                    product_id: plenty.product_id,
                    quantity: 3,
                },
                ReservationRequest {
                    product_id: scarce.product_id,
                    quantity: 1,
                },
                ReservationRequest {
                    product_id: scarce.product_id,
                    quantity: 1,
                },
            ],
            now + Duration::minutes(30),
            now,
        )
        .await
        .unwrap_err();
    tx.commit().await.unwrap();

    assert!(matches!(err, ServiceError::InsufficientStock(ref ids) if ids == &vec![scarce.product_id]));
    assert_eq!(harness.stock(plenty.product_id).await.reserved, 0);
    assert_eq!(harness.stock(scarce.product_id).await.reserved, 0);
}

async fn contended_manager(stock: i64) -> (Arc<InterceptedStore>, InventoryReservationManager, Uuid) {
    let store = InterceptedStore::in_memory();
    let manager = InventoryReservationManager::new(store.clone());
    let product_id = Uuid::new_v4();
    manager.restock(product_id, stock).await.unwrap();
    (store, manager, product_id)
}

fn one(product_id: Uuid, quantity: i64) -> [ReservationRequest; 1] {
    [ReservationRequest {
        product_id,
        quantity,
    }]
}

#[tokio::test]
async fn lost_swap_rereads_and_honours_the_rival_reservation() {
    let (store, manager, product_id) = contended_manager(5).await;
    let now = Utc::now();
    *store.interference.rival_reserves.lock().unwrap() = Some(2);

    let mut tx = store.begin().await.unwrap();
    manager
        .reserve(tx.as_mut(), Uuid::new_v4(), &one(product_id, 3), now, now)
        .await
        .unwrap();
    // One lost swap, then a successful one on the fresh row.
    assert_eq!(store.interference.swaps(), 2);

    // The rival holds two, so nothing is left for a third buyer.
    let late = manager
        .reserve(tx.as_mut(), Uuid::new_v4(), &one(product_id, 1), now, now)
        .await;
    assert_matches!(late, Err(ServiceError::InsufficientStock(ids)) if ids == vec![product_id]);
    tx.commit().await.unwrap();

    let level = manager.availability(product_id).await.unwrap();
    assert_eq!((level.reserved, level.sellable), (5, 0));
}

#[tokio::test]
async fn lost_swap_refuses_when_the_rival_took_the_needed_units() {
    let (store, manager, product_id) = contended_manager(3).await;
    let now = Utc::now();
    *store.interference.rival_reserves.lock().unwrap() = Some(1);

    let mut tx = store.begin().await.unwrap();
    let result = manager
        .reserve(tx.as_mut(), Uuid::new_v4(), &one(product_id, 3), now, now)
        .await;
    assert_matches!(result, Err(ServiceError::InsufficientStock(_)));
    tx.commit().await.unwrap();

    let level = manager.availability(product_id).await.unwrap();
    assert_eq!((level.reserved, level.sellable), (1, 2));
}

#[tokio::test]
async fn endless_conflicts_give_up_after_the_attempt_budget() {
    let (store, manager, product_id) = contended_manager(5).await;
    let manager = manager.with_max_cas_attempts(3);
    let now = Utc::now();
    store.interference.always_stale.store(true, Ordering::SeqCst);

    let mut tx = store.begin().await.unwrap();
    let result = manager
        .reserve(tx.as_mut(), Uuid::new_v4(), &one(product_id, 1), now, now)
        .await;
    assert_matches!(result, Err(ServiceError::ConcurrentModification(id)) if id == product_id);
    assert_eq!(store.interference.swaps(), 3);
    drop(tx);

    store.interference.always_stale.store(false, Ordering::SeqCst);
    let level = manager.availability(product_id).await.unwrap();
    assert_eq!(level.reserved, 0);
}
