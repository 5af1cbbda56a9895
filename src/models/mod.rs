//! Domain model for the checkout engine.
//!
//! All monetary amounts are integer minor units (`i64`). Rates are
//! [`rust_decimal::Decimal`] fractions (`0.18` for 18%).

pub mod cart;
pub mod commission;
pub mod coupon;
pub mod order;
pub mod payment;
pub mod reservation;

pub use cart::{Cart, CartLine, CartStatus, VariantOptions};
pub use commission::{Commission, SellerCommission};
pub use coupon::{Coupon, CouponScope, DiscountKind};
pub use order::{Order, OrderLine, OrderStatus, OrderTotals, TransitionTrigger};
pub use payment::{
    Disposition, OrphanEvent, PaymentEvent, PaymentEventKind, PaymentIntent, ProcessedEvent,
    ReconciliationOutcome,
};
pub use reservation::{Availability, Reservation, ReservationStatus, StockLevel};
