use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscountKind {
    /// Percentage off the eligible subtotal, e.g. `10` for 10%.
    Percentage {
        percent: Decimal,
        /// Upper bound on the discount in minor units.
        max_discount: Option<i64>,
    },
    /// Fixed amount off, never more than the eligible subtotal.
    FixedAmount { amount: i64 },
    FreeShipping,
}

/// Restricts a coupon to lines from given sellers or categories. An empty
/// scope means the whole cart is eligible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponScope {
    #[serde(default)]
    pub seller_ids: Vec<Uuid>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl CouponScope {
    pub fn is_unrestricted(&self) -> bool {
        self.seller_ids.is_empty() && self.categories.is_empty()
    }

    pub fn covers(&self, seller_id: Uuid, category: Option<&str>) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        self.seller_ids.contains(&seller_id)
            || category.is_some_and(|c| self.categories.iter().any(|s| s.eq_ignore_ascii_case(c)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    /// Upper-case normalized code.
    pub code: String,
    pub discount: DiscountKind,
    #[serde(default)]
    pub scope: CouponScope,
    pub min_subtotal: Option<i64>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_limit: Option<i64>,
    pub usage_count: i64,
}

impl Coupon {
    pub fn normalize_code(code: &str) -> String {
        code.trim().to_ascii_uppercase()
    }
}
