use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Selected variant options, e.g. `{"size": "M", "color": "red"}`.
///
/// A `BTreeMap` keeps ordering stable so two lines with the same options
/// compare equal regardless of insertion order.
pub type VariantOptions = BTreeMap<String, String>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CartStatus {
    Active,
    /// Converted into an order. Kept read-only so a retried checkout can
    /// recompute its idempotency key.
    CheckedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    /// Price shown to the buyer when the line was added. Never trusted at
    /// checkout; prices are re-fetched from the catalog.
    pub unit_price: i64,
    pub quantity: i32,
    #[serde(default)]
    pub options: VariantOptions,
}

impl CartLine {
    fn same_item(&self, product_id: Uuid, options: &VariantOptions) -> bool {
        self.product_id == product_id && &self.options == options
    }
}

/// Server-side cart aggregate keyed by buyer id or anonymous session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub id: Uuid,
    pub buyer_id: String,
    pub lines: Vec<CartLine>,
    pub coupon_code: Option<String>,
    pub status: CartStatus,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(buyer_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            buyer_id: buyer_id.into(),
            lines: Vec::new(),
            coupon_code: None,
            status: CartStatus::Active,
            updated_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn ensure_mutable(&self) -> Result<(), ServiceError> {
        if self.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {} has already been checked out",
                self.id
            )));
        }
        Ok(())
    }

    /// Adds a line, merging into an existing (product, variant) line.
    pub fn add_line(
        &mut self,
        product_id: Uuid,
        unit_price: i64,
        quantity: i32,
        options: VariantOptions,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.ensure_mutable()?;
        if quantity < 1 {
            return Err(ServiceError::InvalidQuantity(format!(
                "quantity must be at least 1, got {quantity}"
            )));
        }

        match self
            .lines
            .iter_mut()
            .find(|line| line.same_item(product_id, &options))
        {
            Some(line) => {
                line.quantity = line.quantity.checked_add(quantity).ok_or_else(|| {
                    ServiceError::InvalidQuantity("quantity overflow".to_string())
                })?;
                line.unit_price = unit_price;
            }
            None => self.lines.push(CartLine {
                product_id,
                unit_price,
                quantity,
                options,
            }),
        }
        self.updated_at = now;
        Ok(())
    }

    /// Sets the quantity of an existing line; zero removes it.
    pub fn set_quantity(
        &mut self,
        product_id: Uuid,
        options: &VariantOptions,
        quantity: i32,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.ensure_mutable()?;
        if quantity < 0 {
            return Err(ServiceError::InvalidQuantity(format!(
                "quantity cannot be negative, got {quantity}"
            )));
        }

        let position = self
            .lines
            .iter()
            .position(|line| line.same_item(product_id, options))
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {product_id} is not in cart {}", self.id))
            })?;

        if quantity == 0 {
            self.lines.remove(position);
        } else if let Some(line) = self.lines.get_mut(position) {
            line.quantity = quantity;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn apply_coupon(
        &mut self,
        code: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.ensure_mutable()?;
        self.coupon_code = code.map(|c| c.trim().to_ascii_uppercase()).filter(|c| !c.is_empty());
        self.updated_at = now;
        Ok(())
    }

    pub fn clear(&mut self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        self.ensure_mutable()?;
        self.lines.clear();
        self.coupon_code = None;
        self.updated_at = now;
        Ok(())
    }

    /// Folds `other` into this cart.
    ///
    /// Lines are keyed by (product, variant). On a collision the line from
    /// whichever cart was modified last wins outright (quantities are not
    /// summed). The coupon follows the same rule when both carts carry one.
    pub fn merge_from(&mut self, other: &Cart, now: DateTime<Utc>) -> Result<(), ServiceError> {
        self.ensure_mutable()?;
        let other_is_newer = other.updated_at > self.updated_at;

        for incoming in &other.lines {
            match self
                .lines
                .iter_mut()
                .find(|line| line.same_item(incoming.product_id, &incoming.options))
            {
                Some(existing) if other_is_newer => *existing = incoming.clone(),
                Some(_) => {}
                None => self.lines.push(incoming.clone()),
            }
        }

        match (&self.coupon_code, &other.coupon_code) {
            (None, Some(code)) => self.coupon_code = Some(code.clone()),
            (Some(_), Some(code)) if other_is_newer => self.coupon_code = Some(code.clone()),
            _ => {}
        }

        self.updated_at = now;
        Ok(())
    }

    pub fn mark_checked_out(&mut self) {
        self.status = CartStatus::CheckedOut;
    }

    /// Makes a checked-out cart editable again after its order failed. The
    /// timestamp always moves forward, so the next checkout gets a fresh
    /// idempotency key.
    pub fn reopen(&mut self, now: DateTime<Utc>) {
        self.status = CartStatus::Active;
        self.updated_at = now.max(self.updated_at + chrono::Duration::milliseconds(1));
    }
}
