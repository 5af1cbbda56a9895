// Checkout pipeline
pub mod checkout;
pub mod coupons;
pub mod pricing;

// Orders and stock
pub mod inventory_reservation;
pub mod order_state;
pub mod orders;
pub mod reservation_expirer;

// Payments
pub mod payment_gateway;
pub mod payment_reconciler;

// Carts
pub mod carts;

// Collaborators and shared plumbing
pub mod catalog;
pub mod locks;
pub mod notifications;
