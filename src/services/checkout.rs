//! Checkout Coordinator
//!
//! Turns a buyer's cart into a `PENDING_PAYMENT` order holding its stock and
//! asks the payment gateway for an intent. Stock reservation, order creation
//! and closing the cart commit together; the gateway call happens after the
//! commit, so a gateway failure leaves a recoverable pending order rather
//! than a half-written one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::catalog::ProductCatalog;
use super::coupons::CouponValidator;
use super::inventory_reservation::{InventoryReservationManager, ReservationRequest};
use super::locks::KeyedLocks;
use super::notifications::{NotificationDispatcher, NotificationKind};
use super::order_state::OrderStateMachine;
use super::payment_gateway::{IntentOutcome, IntentRequest, PaymentGateway};
use super::payment_reconciler::PaymentReconciler;
use super::pricing::PricingEngine;
use crate::errors::ServiceError;
use crate::models::{Cart, CartStatus, Coupon, Order, OrderStatus, PaymentIntent, TransitionTrigger};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    /// How long a pending order holds its stock.
    pub reservation_ttl: Duration,
    pub checkout_timeout: Duration,
    pub gateway_timeout: Duration,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            reservation_ttl: Duration::from_secs(30 * 60),
            checkout_timeout: Duration::from_secs(15),
            gateway_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub cart_id: Uuid,
    pub buyer_id: String,
    /// Overrides the coupon stored on the cart.
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutResult {
    pub order: Order,
    /// The order already existed for this cart state.
    pub replayed: bool,
}

/// SHA-256 over (cart, buyer, cart last-modified). Any edit to the cart
/// yields a new key; a retried request for the same cart state does not.
pub fn idempotency_key(cart_id: Uuid, buyer_id: &str, last_modified: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cart_id.as_bytes());
    hasher.update(b"|");
    hasher.update(buyer_id.as_bytes());
    hasher.update(b"|");
    // Microseconds: the finest precision every supported database keeps.
    hasher.update(last_modified.timestamp_micros().to_be_bytes());
    hex::encode(hasher.finalize())
}

pub struct CheckoutDependencies {
    pub store: Arc<dyn Store>,
    pub catalog: Arc<dyn ProductCatalog>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub pricing: PricingEngine,
    pub coupons: CouponValidator,
    pub inventory: InventoryReservationManager,
    pub reconciler: Arc<PaymentReconciler>,
    pub notifications: NotificationDispatcher,
    pub order_locks: KeyedLocks<Uuid>,
    pub settings: CheckoutSettings,
}

pub struct CheckoutCoordinator {
    store: Arc<dyn Store>,
    catalog: Arc<dyn ProductCatalog>,
    gateway: Arc<dyn PaymentGateway>,
    pricing: PricingEngine,
    coupons: CouponValidator,
    inventory: InventoryReservationManager,
    reconciler: Arc<PaymentReconciler>,
    notifications: NotificationDispatcher,
    order_locks: KeyedLocks<Uuid>,
    key_locks: KeyedLocks<String>,
    settings: CheckoutSettings,
}

impl CheckoutCoordinator {
    pub fn new(deps: CheckoutDependencies) -> Self {
        Self {
            store: deps.store,
            catalog: deps.catalog,
            gateway: deps.gateway,
            pricing: deps.pricing,
            coupons: deps.coupons,
            inventory: deps.inventory,
            reconciler: deps.reconciler,
            notifications: deps.notifications,
            order_locks: deps.order_locks,
            key_locks: KeyedLocks::new(),
            settings: deps.settings,
        }
    }

    pub fn settings(&self) -> &CheckoutSettings {
        &self.settings
    }

    /// Checks out a cart. Bounded by the configured checkout timeout.
    #[instrument(skip(self, request), fields(cart_id = %request.cart_id))]
    pub async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutResult, ServiceError> {
        match tokio::time::timeout(self.settings.checkout_timeout, self.run_checkout(request)).await
        {
            Ok(result) => result,
            Err(_) => {
                counter!("checkout.timeouts", 1);
                warn!(timeout = ?self.settings.checkout_timeout, "checkout timed out");
                Err(ServiceError::CheckoutTimeout)
            }
        }
    }

    async fn run_checkout(&self, request: CheckoutRequest) -> Result<CheckoutResult, ServiceError> {
        let cart = self.load_cart(request.cart_id, &request.buyer_id).await?;
        if cart.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let key = idempotency_key(cart.id, &cart.buyer_id, cart.updated_at);
        let _key_guard = self.key_locks.lock(key.clone()).await;

        if let Some(existing) = self.find_order_by_key(&key).await? {
            counter!("checkout.replays", 1);
            info!(order_id = %existing.id, status = %existing.status, "checkout replayed");
            let order = if existing.status == OrderStatus::PendingPayment
                && existing.payment_intent_id.is_none()
            {
                self.request_payment_intent(existing).await?
            } else {
                existing
            };
            return Ok(CheckoutResult {
                order,
                replayed: true,
            });
        }

        if cart.status == CartStatus::CheckedOut {
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {} has already been checked out",
                cart.id
            )));
        }

        let now = Utc::now();
        let priced = self.pricing.reprice(self.catalog.as_ref(), &cart).await?;

        let coupon_code = request
            .coupon_code
            .or_else(|| cart.coupon_code.clone())
            .map(|code| Coupon::normalize_code(&code))
            .filter(|code| !code.is_empty());
        let coupon = match &coupon_code {
            Some(code) => Some(self.coupons.resolve(code, &priced, now).await?),
            None => None,
        };
        let priced_order = self.pricing.price(&priced, coupon.as_ref())?;

        let mut order = Order {
            id: Uuid::new_v4(),
            buyer_id: cart.buyer_id.clone(),
            cart_id: cart.id,
            lines: priced_order.lines,
            totals: priced_order.totals,
            seller_commissions: priced_order.seller_commissions,
            coupon_code: coupon.map(|c| c.code),
            currency: self.settings.currency.clone(),
            status: OrderStatus::Draft,
            payment_intent_id: None,
            payment_client_secret: None,
            idempotency_key: key,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let requests: Vec<ReservationRequest> = order
            .lines
            .iter()
            .map(|line| ReservationRequest {
                product_id: line.product_id,
                quantity: line.quantity,
            })
            .collect();
        let ttl = chrono::Duration::from_std(self.settings.reservation_ttl)
            .map_err(|e| ServiceError::InternalError(format!("reservation ttl: {e}")))?;

        let mut tx = self.store.begin().await?;
        let mut stored_cart = tx
            .get_cart(cart.id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart.id)))?;
        if stored_cart.updated_at != cart.updated_at || stored_cart.status != CartStatus::Active {
            return Err(ServiceError::ConcurrentModification(cart.id));
        }

        self.inventory
            .reserve(tx.as_mut(), order.id, &requests, now + ttl, now)
            .await?;
        OrderStateMachine::place(tx.as_mut(), &mut order, now).await?;
        stored_cart.mark_checked_out();
        tx.save_cart(&stored_cart).await?;
        tx.commit().await?;

        counter!("checkout.orders.created", 1);
        info!(
            order_id = %order.id,
            buyer_id = %order.buyer_id,
            grand_total = order.totals.grand_total,
            "order placed, awaiting payment"
        );

        let order = self.request_payment_intent(order).await?;
        Ok(CheckoutResult {
            order,
            replayed: false,
        })
    }

    async fn load_cart(&self, cart_id: Uuid, buyer_id: &str) -> Result<Cart, ServiceError> {
        let mut tx = self.store.begin().await?;
        let cart = tx
            .get_cart(cart_id)
            .await?
            .filter(|cart| cart.buyer_id == buyer_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {cart_id} not found")))?;
        Ok(cart)
    }

    async fn find_order_by_key(&self, key: &str) -> Result<Option<Order>, ServiceError> {
        let mut tx = self.store.begin().await?;
        let order = tx.find_order_by_idempotency_key(key).await?;
        Ok(order)
    }

    async fn load_order(&self, order_id: Uuid) -> Result<Order, ServiceError> {
        let mut tx = self.store.begin().await?;
        let order = tx
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;
        Ok(order)
    }

    /// Asks the gateway for an intent and records the answer on the order.
    async fn request_payment_intent(&self, order: Order) -> Result<Order, ServiceError> {
        let request = IntentRequest {
            order_id: order.id,
            amount: order.totals.grand_total,
            currency: order.currency.clone(),
            idempotency_key: order.idempotency_key.clone(),
        };

        let outcome = match tokio::time::timeout(
            self.settings.gateway_timeout,
            self.gateway.create_intent(&request),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                counter!("checkout.gateway.failures", 1);
                warn!(order_id = %order.id, error = %e, "payment intent request failed; order stays pending");
                return Err(e.into_service_error(order.id));
            }
            Err(_) => {
                counter!("checkout.gateway.failures", 1);
                warn!(order_id = %order.id, "payment intent request timed out; order stays pending");
                return Err(ServiceError::PaymentGatewayTimeout(order.id));
            }
        };

        match outcome {
            IntentOutcome::Declined { reason } => {
                self.record_decline(order.id, &reason).await?;
                Err(ServiceError::PaymentDeclined {
                    order_id: order.id,
                    reason,
                })
            }
            IntentOutcome::Created(intent) => {
                let order = self.attach_intent(order.id, &intent).await?;
                self.notifications
                    .dispatch(order.id, NotificationKind::OrderPlaced);

                let redelivered = match self.reconciler.redeliver_orphans(&intent.id).await {
                    Ok(outcomes) => !outcomes.is_empty(),
                    Err(e) => {
                        warn!(order_id = %order.id, error = %e, "orphan redelivery failed");
                        false
                    }
                };
                if redelivered {
                    return self.load_order(order.id).await;
                }
                Ok(order)
            }
        }
    }

    async fn attach_intent(
        &self,
        order_id: Uuid,
        intent: &PaymentIntent,
    ) -> Result<Order, ServiceError> {
        let _guard = self.order_locks.lock(order_id).await;
        let mut tx = self.store.begin().await?;
        let mut order = tx
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;
        if order.status != OrderStatus::PendingPayment {
            // Expired or cancelled while the gateway was answering. Keep the
            // intent so a late confirmation still finds the order.
            warn!(%order_id, status = %order.status, "intent arrived for an order no longer pending");
        }
        OrderStateMachine::attach_payment_intent(tx.as_mut(), &mut order, intent, Utc::now())
            .await?;
        tx.commit().await?;
        Ok(order)
    }

    async fn record_decline(&self, order_id: Uuid, reason: &str) -> Result<(), ServiceError> {
        let _guard = self.order_locks.lock(order_id).await;
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut order = tx
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;
        if order.status != OrderStatus::PendingPayment {
            return Ok(());
        }

        OrderStateMachine::transition(
            tx.as_mut(),
            &mut order,
            OrderStatus::PaymentFailed,
            TransitionTrigger::SynchronousDecline,
            now,
        )
        .await?;
        self.inventory.release(tx.as_mut(), order_id, now).await?;
        if let Some(mut cart) = tx.get_cart(order.cart_id).await? {
            if cart.status == CartStatus::CheckedOut {
                cart.reopen(now);
                tx.save_cart(&cart).await?;
            }
        }
        tx.commit().await?;

        counter!("checkout.payments.declined", 1);
        warn!(%order_id, reason, "payment declined by gateway");
        self.notifications
            .dispatch(order_id, NotificationKind::PaymentFailed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn idempotency_key_tracks_cart_state() {
        let cart_id = Uuid::new_v4();
        let at = Utc::now();

        let first = idempotency_key(cart_id, "buyer-1", at);
        assert_eq!(first, idempotency_key(cart_id, "buyer-1", at));
        assert_eq!(first.len(), 64);
        assert_ne!(first, idempotency_key(cart_id, "buyer-2", at));
        assert_ne!(
            first,
            idempotency_key(cart_id, "buyer-1", at + ChronoDuration::seconds(1))
        );
    }
}
