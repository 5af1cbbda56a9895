//! Order pricing.
//!
//! Pure computation over freshly priced lines: subtotal, coupon discount,
//! tax, shipping and the platform commission per seller. Everything is in
//! integer minor units; rates are applied with half-away-from-zero rounding.

use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::catalog::ProductCatalog;
use super::coupons::ResolvedCoupon;
use crate::errors::ServiceError;
use crate::models::{Cart, DiscountKind, OrderLine, OrderTotals, SellerCommission, VariantOptions};

/// Which amount the tax rate is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxBase {
    /// `subtotal - discount`
    Discounted,
    /// `subtotal`, ignoring any discount
    Gross,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingRules {
    pub tax_rate: Decimal,
    pub tax_base: TaxBase,
    pub shipping_flat_fee: i64,
    pub free_shipping_threshold: Option<i64>,
    pub commission_rate: Decimal,
}

/// A cart line after its price was re-fetched from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedLine {
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub category: Option<String>,
    pub options: VariantOptions,
    pub quantity: i64,
    pub unit_price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingResult {
    pub lines: Vec<OrderLine>,
    pub totals: OrderTotals,
    pub seller_commissions: Vec<SellerCommission>,
}

/// `round(amount * rate)` to whole minor units, halves away from zero.
pub fn apply_rate(amount: i64, rate: Decimal) -> Result<i64, ServiceError> {
    (Decimal::from(amount) * rate)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ServiceError::InternalError(format!("amount {amount} overflowed")))
}

fn checked_total(unit_price: i64, quantity: i64) -> Result<i64, ServiceError> {
    unit_price
        .checked_mul(quantity)
        .ok_or_else(|| ServiceError::InvalidQuantity(format!("line total overflow ({quantity})")))
}

#[derive(Debug, Clone)]
pub struct PricingEngine {
    rules: PricingRules,
}

impl PricingEngine {
    pub fn new(rules: PricingRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &PricingRules {
        &self.rules
    }

    /// Re-fetches the live price of every cart line. Any failed lookup aborts
    /// the whole repricing with `PriceUnavailable`.
    pub async fn reprice(
        &self,
        catalog: &dyn ProductCatalog,
        cart: &Cart,
    ) -> Result<Vec<PricedLine>, ServiceError> {
        let mut priced = Vec::with_capacity(cart.lines.len());
        for line in &cart.lines {
            let price = catalog
                .current_price(line.product_id)
                .await
                .map_err(|_| ServiceError::PriceUnavailable(line.product_id))?;
            priced.push(PricedLine {
                product_id: line.product_id,
                seller_id: price.seller_id,
                category: price.category,
                options: line.options.clone(),
                quantity: i64::from(line.quantity),
                unit_price: price.unit_price,
            });
        }
        Ok(priced)
    }

    pub fn price(
        &self,
        lines: &[PricedLine],
        coupon: Option<&ResolvedCoupon>,
    ) -> Result<PricingResult, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let mut order_lines = Vec::with_capacity(lines.len());
        for line in lines {
            if line.quantity <= 0 {
                return Err(ServiceError::InvalidQuantity(format!(
                    "quantity for product {} must be at least 1, got {}",
                    line.product_id, line.quantity
                )));
            }
            if line.unit_price < 0 {
                return Err(ServiceError::PriceUnavailable(line.product_id));
            }
            order_lines.push(OrderLine {
                product_id: line.product_id,
                seller_id: line.seller_id,
                category: line.category.clone(),
                options: line.options.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                line_total: checked_total(line.unit_price, line.quantity)?,
                discount: 0,
            });
        }

        let subtotal = order_lines.iter().try_fold(0i64, |acc, line| {
            acc.checked_add(line.line_total)
                .ok_or_else(|| ServiceError::InvalidQuantity("subtotal overflow".to_string()))
        })?;

        let mut free_shipping = false;
        let discount = match coupon {
            Some(coupon) => {
                let eligible: Vec<usize> = order_lines
                    .iter()
                    .enumerate()
                    .filter(|(_, line)| coupon.scope.covers(line.seller_id, line.category.as_deref()))
                    .map(|(index, _)| index)
                    .collect();
                let eligible_subtotal: i64 =
                    eligible.iter().map(|&i| order_lines[i].line_total).sum();

                let amount = match &coupon.discount {
                    DiscountKind::Percentage {
                        percent,
                        max_discount,
                    } => {
                        let raw = apply_rate(eligible_subtotal, *percent / Decimal::ONE_HUNDRED)?;
                        max_discount.map_or(raw, |cap| raw.min(cap))
                    }
                    DiscountKind::FixedAmount { amount } => *amount,
                    DiscountKind::FreeShipping => {
                        free_shipping = true;
                        0
                    }
                }
                .clamp(0, eligible_subtotal);

                allocate_discount(&mut order_lines, &eligible, eligible_subtotal, amount);
                amount
            }
            None => 0,
        };

        let discounted_subtotal = subtotal - discount;
        let tax_base_amount = match self.rules.tax_base {
            TaxBase::Discounted => discounted_subtotal,
            TaxBase::Gross => subtotal,
        };
        let tax = apply_rate(tax_base_amount, self.rules.tax_rate)?;

        let threshold_met = self
            .rules
            .free_shipping_threshold
            .is_some_and(|threshold| discounted_subtotal >= threshold);
        let shipping = if free_shipping || threshold_met {
            0
        } else {
            self.rules.shipping_flat_fee
        };

        let seller_commissions = self.seller_commissions(&order_lines)?;
        let commission = seller_commissions.iter().map(|c| c.amount).sum();

        let totals = OrderTotals {
            subtotal,
            discount,
            tax,
            shipping,
            commission,
            grand_total: discounted_subtotal + tax + shipping,
        };

        Ok(PricingResult {
            lines: order_lines,
            totals,
            seller_commissions,
        })
    }

    fn seller_commissions(
        &self,
        lines: &[OrderLine],
    ) -> Result<Vec<SellerCommission>, ServiceError> {
        let mut by_seller: BTreeMap<Uuid, i64> = BTreeMap::new();
        for line in lines {
            *by_seller.entry(line.seller_id).or_default() += line.line_total;
        }
        by_seller
            .into_iter()
            .map(|(seller_id, seller_subtotal)| {
                Ok(SellerCommission {
                    seller_id,
                    seller_subtotal,
                    amount: apply_rate(seller_subtotal, self.rules.commission_rate)?,
                })
            })
            .collect()
    }
}

/// Spreads `amount` over the eligible lines in proportion to their totals.
/// Rounding leftovers go to the last eligible lines with room left; no line
/// is discounted below zero.
fn allocate_discount(lines: &mut [OrderLine], eligible: &[usize], eligible_subtotal: i64, amount: i64) {
    if amount == 0 || eligible_subtotal == 0 {
        return;
    }
    let mut allocated = 0;
    for &index in eligible {
        let proportional = i128::from(amount) * i128::from(lines[index].line_total)
            / i128::from(eligible_subtotal);
        let share = i64::try_from(proportional).unwrap_or(0);
        lines[index].discount = share;
        allocated += share;
    }

    let mut leftover = amount - allocated;
    for &index in eligible.iter().rev() {
        if leftover <= 0 {
            break;
        }
        let extra = (lines[index].line_total - lines[index].discount).min(leftover);
        lines[index].discount += extra;
        leftover -= extra;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CouponScope;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn rules(tax_base: TaxBase) -> PricingRules {
        PricingRules {
            tax_rate: dec!(0.18),
            tax_base,
            shipping_flat_fee: 500,
            free_shipping_threshold: None,
            commission_rate: dec!(0.10),
        }
    }

    fn line(seller_id: Uuid, unit_price: i64, quantity: i64) -> PricedLine {
        PricedLine {
            product_id: Uuid::new_v4(),
            seller_id,
            category: Some("apparel".into()),
            options: VariantOptions::new(),
            quantity,
            unit_price,
        }
    }

    fn welcome10() -> ResolvedCoupon {
        ResolvedCoupon {
            code: "WELCOME10".into(),
            discount: DiscountKind::Percentage {
                percent: dec!(10),
                max_discount: None,
            },
            scope: CouponScope::default(),
        }
    }

    #[test]
    fn two_units_at_ten_thousand() {
        let engine = PricingEngine::new(rules(TaxBase::Discounted));
        let result = engine.price(&[line(Uuid::new_v4(), 10_000, 2)], None).unwrap();

        assert_eq!(result.totals.subtotal, 20_000);
        assert_eq!(result.totals.tax, 3_600);
        assert_eq!(result.totals.shipping, 500);
        assert_eq!(result.totals.grand_total, 24_100);
        assert!(result.totals.is_balanced());
    }

    #[test]
    fn welcome10_taxed_on_discounted_base() {
        let engine = PricingEngine::new(rules(TaxBase::Discounted));
        let result = engine
            .price(&[line(Uuid::new_v4(), 10_000, 2)], Some(&welcome10()))
            .unwrap();

        assert_eq!(result.totals.discount, 2_000);
        assert_eq!(result.totals.tax, 3_240);
        assert_eq!(result.totals.grand_total, 21_740);
    }

    #[test]
    fn welcome10_taxed_on_gross_base() {
        let engine = PricingEngine::new(rules(TaxBase::Gross));
        let result = engine
            .price(&[line(Uuid::new_v4(), 10_000, 2)], Some(&welcome10()))
            .unwrap();

        assert_eq!(result.totals.discount, 2_000);
        assert_eq!(result.totals.tax, 3_600);
        assert_eq!(result.totals.grand_total, 22_100);
    }

    #[test]
    fn fixed_discount_never_exceeds_eligible_subtotal() {
        let engine = PricingEngine::new(rules(TaxBase::Discounted));
        let coupon = ResolvedCoupon {
            code: "BIG".into(),
            discount: DiscountKind::FixedAmount { amount: 50_000 },
            scope: CouponScope::default(),
        };
        let result = engine
            .price(&[line(Uuid::new_v4(), 1_000, 1)], Some(&coupon))
            .unwrap();

        assert_eq!(result.totals.discount, 1_000);
        assert_eq!(result.totals.tax, 0);
        assert_eq!(result.totals.grand_total, 500);
    }

    #[test]
    fn scoped_coupon_only_discounts_covered_seller() {
        let covered = Uuid::new_v4();
        let other = Uuid::new_v4();
        let coupon = ResolvedCoupon {
            code: "SELLER".into(),
            discount: DiscountKind::Percentage {
                percent: dec!(50),
                max_discount: Some(1_500),
            },
            scope: CouponScope {
                seller_ids: vec![covered],
                categories: vec![],
            },
        };
        let engine = PricingEngine::new(rules(TaxBase::Discounted));
        let result = engine
            .price(&[line(covered, 4_000, 1), line(other, 6_000, 1)], Some(&coupon))
            .unwrap();

        assert_eq!(result.totals.discount, 1_500);
        assert_eq!(result.lines[0].discount, 1_500);
        assert_eq!(result.lines[1].discount, 0);
    }

    #[test]
    fn discount_allocation_sums_to_total() {
        let seller = Uuid::new_v4();
        let coupon = ResolvedCoupon {
            code: "TEN".into(),
            discount: DiscountKind::FixedAmount { amount: 1_000 },
            scope: CouponScope::default(),
        };
        let engine = PricingEngine::new(rules(TaxBase::Discounted));
        let result = engine
            .price(
                &[line(seller, 333, 1), line(seller, 333, 1), line(seller, 334, 1)],
                Some(&coupon),
            )
            .unwrap();

        let allocated: i64 = result.lines.iter().map(|l| l.discount).sum();
        assert_eq!(allocated, result.totals.discount);
    }

    #[test]
    fn free_shipping_from_coupon_and_threshold() {
        let engine = PricingEngine::new(rules(TaxBase::Discounted));
        let coupon = ResolvedCoupon {
            code: "SHIPFREE".into(),
            discount: DiscountKind::FreeShipping,
            scope: CouponScope::default(),
        };
        let result = engine
            .price(&[line(Uuid::new_v4(), 1_000, 1)], Some(&coupon))
            .unwrap();
        assert_eq!(result.totals.shipping, 0);
        assert_eq!(result.totals.discount, 0);

        let mut threshold_rules = rules(TaxBase::Discounted);
        threshold_rules.free_shipping_threshold = Some(5_000);
        let engine = PricingEngine::new(threshold_rules);
        let result = engine.price(&[line(Uuid::new_v4(), 5_000, 1)], None).unwrap();
        assert_eq!(result.totals.shipping, 0);
    }

    #[test]
    fn commission_is_per_seller_and_informational() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let engine = PricingEngine::new(rules(TaxBase::Discounted));
        let result = engine
            .price(&[line(a, 10_005, 1), line(b, 2_000, 2)], None)
            .unwrap();

        let for_a = result
            .seller_commissions
            .iter()
            .find(|c| c.seller_id == a)
            .unwrap();
        // 1000.5 rounds away from zero
        assert_eq!(for_a.amount, 1_001);
        assert_eq!(result.totals.commission, 1_001 + 400);
        assert_eq!(
            result.totals.grand_total,
            result.totals.subtotal + result.totals.tax + result.totals.shipping
        );
    }

    #[test]
    fn rejects_empty_and_non_positive_quantities() {
        let engine = PricingEngine::new(rules(TaxBase::Discounted));
        assert_matches!(engine.price(&[], None), Err(ServiceError::EmptyCart));
        assert_matches!(
            engine.price(&[line(Uuid::new_v4(), 100, 0)], None),
            Err(ServiceError::InvalidQuantity(_))
        );
    }

    #[test]
    fn apply_rate_rounds_half_away_from_zero() {
        assert_eq!(apply_rate(5, dec!(0.5)).unwrap(), 3);
        assert_eq!(apply_rate(-5, dec!(0.5)).unwrap(), -3);
        assert_eq!(apply_rate(4, dec!(0.5)).unwrap(), 2);
    }
}
