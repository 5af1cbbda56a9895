use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::pricing::PricedLine;
use crate::errors::ServiceError;
use crate::models::{Coupon, CouponScope, DiscountKind};
use crate::store::{Store, StoreTx};

/// A coupon that passed validation, reduced to what pricing needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCoupon {
    pub code: String,
    pub discount: DiscountKind,
    pub scope: CouponScope,
}

/// Checks a coupon against the lines it would apply to.
///
/// Order of checks: activation window, expiry, usage limit, scope, minimum
/// subtotal. The first failure wins.
pub fn validate_coupon(
    coupon: &Coupon,
    lines: &[PricedLine],
    now: DateTime<Utc>,
) -> Result<ResolvedCoupon, ServiceError> {
    if coupon.starts_at.is_some_and(|starts| now < starts) {
        return Err(ServiceError::CouponInvalid(format!(
            "{} is not active yet",
            coupon.code
        )));
    }
    if coupon.expires_at.is_some_and(|expires| now >= expires) {
        return Err(ServiceError::CouponExpired(coupon.code.clone()));
    }
    if coupon
        .usage_limit
        .is_some_and(|limit| coupon.usage_count >= limit)
    {
        return Err(ServiceError::CouponExhausted(coupon.code.clone()));
    }
    if !coupon.scope.is_unrestricted()
        && !lines
            .iter()
            .any(|line| coupon.scope.covers(line.seller_id, line.category.as_deref()))
    {
        return Err(ServiceError::CouponInvalid(format!(
            "{} does not apply to any item in the cart",
            coupon.code
        )));
    }
    if let Some(minimum) = coupon.min_subtotal {
        let subtotal: i64 = lines
            .iter()
            .map(|line| line.unit_price.saturating_mul(line.quantity))
            .sum();
        if subtotal < minimum {
            return Err(ServiceError::CouponInvalid(format!(
                "{} requires a subtotal of at least {minimum}",
                coupon.code
            )));
        }
    }

    Ok(ResolvedCoupon {
        code: coupon.code.clone(),
        discount: coupon.discount.clone(),
        scope: coupon.scope.clone(),
    })
}

#[derive(Clone)]
pub struct CouponValidator {
    store: Arc<dyn Store>,
}

impl CouponValidator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Looks the code up and validates it. Reads a snapshot; nothing is
    /// reserved or consumed.
    #[instrument(skip(self, lines))]
    pub async fn resolve(
        &self,
        code: &str,
        lines: &[PricedLine],
        now: DateTime<Utc>,
    ) -> Result<ResolvedCoupon, ServiceError> {
        let normalized = Coupon::normalize_code(code);
        let mut tx = self.store.begin().await?;
        let coupon = tx
            .get_coupon(&normalized)
            .await?
            .ok_or_else(|| ServiceError::CouponInvalid(format!("{normalized} does not exist")))?;
        drop(tx);

        let resolved = validate_coupon(&coupon, lines, now)?;
        debug!(code = %resolved.code, "coupon accepted");
        Ok(resolved)
    }

    /// Creates or replaces a coupon definition.
    pub async fn upsert(&self, mut coupon: Coupon) -> Result<Coupon, ServiceError> {
        coupon.code = Coupon::normalize_code(&coupon.code);
        if coupon.code.is_empty() {
            return Err(ServiceError::ValidationError(
                "coupon code must not be empty".to_string(),
            ));
        }
        let mut tx = self.store.begin().await?;
        tx.save_coupon(&coupon).await?;
        let stored = tx.get_coupon(&coupon.code).await?.ok_or_else(|| {
            ServiceError::InternalError(format!("coupon {} vanished after save", coupon.code))
        })?;
        tx.commit().await?;
        info!(code = %stored.code, usage_count = stored.usage_count, "coupon saved");
        Ok(stored)
    }

    pub async fn get(&self, code: &str) -> Result<Option<Coupon>, ServiceError> {
        let mut tx = self.store.begin().await?;
        let coupon = tx.get_coupon(&Coupon::normalize_code(code)).await?;
        Ok(coupon)
    }
}

/// Records one use of the coupon inside the caller's transaction. A paid
/// order is never refused here, even when concurrent checkouts pushed the
/// count past its limit.
pub async fn consume_coupon(tx: &mut dyn StoreTx, code: &str) -> Result<(), ServiceError> {
    match tx.increment_coupon_usage(code).await? {
        Some(coupon) => {
            if let Some(limit) = coupon.usage_limit {
                if coupon.usage_count > limit {
                    warn!(
                        code = %coupon.code,
                        usage_count = coupon.usage_count,
                        usage_limit = limit,
                        "coupon used beyond its limit by concurrently validated orders"
                    );
                }
            }
        }
        None => warn!(code, "paid order references a coupon that no longer exists"),
    }
    Ok(())
}
