//! Marketplace checkout engine
//!
//! Cart pricing, stock reservation, order lifecycle and payment
//! reconciliation for a multi-seller marketplace, exposed over HTTP.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod services;
pub mod store;
pub mod tracing;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::task::JoinHandle;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::services::{
    carts::CartService,
    catalog::ProductCatalog,
    checkout::{CheckoutCoordinator, CheckoutDependencies},
    coupons::CouponValidator,
    inventory_reservation::InventoryReservationManager,
    locks::KeyedLocks,
    notifications::{NotificationDispatcher, Notifier},
    orders::OrderService,
    payment_gateway::PaymentGateway,
    payment_reconciler::PaymentReconciler,
    pricing::PricingEngine,
    reservation_expirer::ReservationExpirer,
};
use crate::store::Store;

/// External collaborators the service is wired against.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub catalog: Arc<dyn ProductCatalog>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub carts: CartService,
    pub coupons: CouponValidator,
    pub inventory: InventoryReservationManager,
    pub checkout: Arc<CheckoutCoordinator>,
    pub reconciler: Arc<PaymentReconciler>,
    pub orders: OrderService,
    pub expirer: Arc<ReservationExpirer>,
    pub notifications: NotificationDispatcher,
}

impl AppState {
    /// Wires every service. Must run inside a Tokio runtime: the
    /// notification worker is spawned here and its handle returned.
    pub fn build(
        config: AppConfig,
        collaborators: Collaborators,
    ) -> Result<(Self, JoinHandle<()>), ServiceError> {
        let Collaborators {
            store,
            catalog,
            gateway,
            notifier,
        } = collaborators;

        let (notifications, notification_worker) =
            NotificationDispatcher::start(notifier, config.notification_queue_capacity);
        let order_locks: KeyedLocks<Uuid> = KeyedLocks::new();
        let inventory = InventoryReservationManager::new(store.clone());
        let coupons = CouponValidator::new(store.clone());

        let reconciler = Arc::new(PaymentReconciler::new(
            store.clone(),
            inventory.clone(),
            notifications.clone(),
            order_locks.clone(),
        ));

        let checkout = Arc::new(CheckoutCoordinator::new(CheckoutDependencies {
            store: store.clone(),
            catalog: catalog.clone(),
            gateway,
            pricing: PricingEngine::new(config.pricing_rules()),
            coupons: coupons.clone(),
            inventory: inventory.clone(),
            reconciler: reconciler.clone(),
            notifications: notifications.clone(),
            order_locks: order_locks.clone(),
            settings: config.checkout_settings(),
        }));

        let expirer = Arc::new(ReservationExpirer::new(
            store.clone(),
            inventory.clone(),
            notifications.clone(),
            reconciler.clone(),
            order_locks.clone(),
            Duration::from_secs(config.reservation_ttl_secs),
            config.expiry_batch_size,
        )?);

        let orders = OrderService::new(
            store.clone(),
            inventory.clone(),
            notifications.clone(),
            order_locks,
        );

        let state = Self {
            config: Arc::new(config),
            carts: CartService::new(store.clone(), catalog),
            store,
            coupons,
            inventory,
            checkout,
            reconciler,
            orders,
            expirer,
            notifications,
        };
        Ok((state, notification_worker))
    }
}

/// Full HTTP surface with the request-id, trace and timeout layers.
///
/// The request timeout sits above the checkout timeout so checkout can
/// answer with its own error first.
pub fn build_router(state: AppState) -> Router {
    let request_timeout = Duration::from_millis(state.config.checkout_timeout_ms)
        + Duration::from_secs(5);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api/v1", handlers::api_v1_routes())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http().make_span_with(crate::tracing::RequestSpanMaker))
        .layer(axum::middleware::from_fn(
            crate::tracing::request_id_middleware,
        ))
        .with_state(state)
}
