use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::catalog::ProductCatalog;
use crate::errors::ServiceError;
use crate::models::{Cart, CartStatus, VariantOptions};
use crate::store::{Store, StoreTx};

/// Server-side cart operations. A cart is only visible to the buyer (or
/// guest session) that owns it.
#[derive(Clone)]
pub struct CartService {
    store: Arc<dyn Store>,
    catalog: Arc<dyn ProductCatalog>,
}

async fn owned_cart(
    tx: &mut dyn StoreTx,
    cart_id: Uuid,
    owner: &str,
) -> Result<Cart, ServiceError> {
    let cart = tx
        .get_cart(cart_id)
        .await?
        .filter(|cart| cart.buyer_id == owner)
        .ok_or_else(|| ServiceError::NotFound(format!("Cart {cart_id} not found")))?;
    Ok(cart)
}

impl CartService {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<dyn ProductCatalog>) -> Self {
        Self { store, catalog }
    }

    #[instrument(skip(self))]
    pub async fn create(&self, buyer_id: &str) -> Result<Cart, ServiceError> {
        if buyer_id.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "buyer id must not be empty".to_string(),
            ));
        }
        let cart = Cart::new(buyer_id, Utc::now());
        let mut tx = self.store.begin().await?;
        tx.save_cart(&cart).await?;
        tx.commit().await?;
        info!(cart_id = %cart.id, "cart created");
        Ok(cart)
    }

    pub async fn get(&self, cart_id: Uuid, buyer_id: &str) -> Result<Cart, ServiceError> {
        let mut tx = self.store.begin().await?;
        let cart = owned_cart(tx.as_mut(), cart_id, buyer_id).await?;
        Ok(cart)
    }

    async fn update<F>(&self, cart_id: Uuid, buyer_id: &str, change: F) -> Result<Cart, ServiceError>
    where
        F: FnOnce(&mut Cart) -> Result<(), ServiceError>,
    {
        let mut tx = self.store.begin().await?;
        let mut cart = owned_cart(tx.as_mut(), cart_id, buyer_id).await?;
        change(&mut cart)?;
        tx.save_cart(&cart).await?;
        tx.commit().await?;
        Ok(cart)
    }

    /// Adds a line with the catalog's current price as the display snapshot.
    #[instrument(skip(self, options))]
    pub async fn add_line(
        &self,
        cart_id: Uuid,
        buyer_id: &str,
        product_id: Uuid,
        quantity: i32,
        options: VariantOptions,
    ) -> Result<Cart, ServiceError> {
        let price = self.catalog.current_price(product_id).await?;
        self.update(cart_id, buyer_id, |cart| {
            cart.add_line(product_id, price.unit_price, quantity, options, Utc::now())
        })
        .await
    }

    /// Zero removes the line.
    #[instrument(skip(self, options))]
    pub async fn set_quantity(
        &self,
        cart_id: Uuid,
        buyer_id: &str,
        product_id: Uuid,
        options: VariantOptions,
        quantity: i32,
    ) -> Result<Cart, ServiceError> {
        self.update(cart_id, buyer_id, |cart| {
            cart.set_quantity(product_id, &options, quantity, Utc::now())
        })
        .await
    }

    /// Stores the code only; it is validated against current prices at
    /// checkout.
    pub async fn apply_coupon(
        &self,
        cart_id: Uuid,
        buyer_id: &str,
        code: Option<String>,
    ) -> Result<Cart, ServiceError> {
        self.update(cart_id, buyer_id, |cart| cart.apply_coupon(code, Utc::now()))
            .await
    }

    pub async fn clear(&self, cart_id: Uuid, buyer_id: &str) -> Result<Cart, ServiceError> {
        self.update(cart_id, buyer_id, |cart| cart.clear(Utc::now()))
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, cart_id: Uuid, buyer_id: &str) -> Result<(), ServiceError> {
        let mut tx = self.store.begin().await?;
        owned_cart(tx.as_mut(), cart_id, buyer_id).await?;
        tx.delete_cart(cart_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Folds a guest cart into the buyer's cart and deletes the guest cart,
    /// in one transaction. `source_owner` is the guest session token the
    /// source cart was created under.
    #[instrument(skip(self))]
    pub async fn merge(
        &self,
        target_id: Uuid,
        buyer_id: &str,
        source_id: Uuid,
        source_owner: &str,
    ) -> Result<Cart, ServiceError> {
        if target_id == source_id {
            return Err(ServiceError::InvalidOperation(
                "a cart cannot be merged into itself".to_string(),
            ));
        }

        let mut tx = self.store.begin().await?;
        let mut target = owned_cart(tx.as_mut(), target_id, buyer_id).await?;
        let source = owned_cart(tx.as_mut(), source_id, source_owner).await?;
        if source.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {source_id} has already been checked out"
            )));
        }

        target.merge_from(&source, Utc::now())?;
        tx.save_cart(&target).await?;
        tx.delete_cart(source_id).await?;
        tx.commit().await?;

        info!(
            %target_id,
            %source_id,
            lines = target.lines.len(),
            "carts merged"
        );
        Ok(target)
    }
}
