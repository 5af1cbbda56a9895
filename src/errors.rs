use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::OrderStatus;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

fn join_ids(ids: &[Uuid]) -> String {
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Conflict")
    pub error: String,
    /// Stable machine-readable code, e.g. `INSUFFICIENT_STOCK`
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub retryable: bool,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    // Client input
    #[error("Cart is empty")]
    EmptyCart,

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Coupon invalid: {0}")]
    CouponInvalid(String),

    #[error("Coupon expired: {0}")]
    CouponExpired(String),

    #[error("Coupon exhausted: {0}")]
    CouponExhausted(String),

    // Resource contention
    #[error("Insufficient stock for product(s): {}", join_ids(.0))]
    InsufficientStock(Vec<Uuid>),

    #[error("Price unavailable for product {0}")]
    PriceUnavailable(Uuid),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    // External dependencies
    #[error("Payment gateway timed out for order {0}")]
    PaymentGatewayTimeout(Uuid),

    #[error("Payment gateway unavailable: {0}")]
    PaymentGatewayUnavailable(String),

    #[error("Payment declined for order {order_id}: {reason}")]
    PaymentDeclined { order_id: Uuid, reason: String },

    #[error("Checkout timed out")]
    CheckoutTimeout,

    // Consistency guards
    #[error("Invalid transition for order {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Orphan payment event {event_id} for intent {payment_intent_id}")]
    OrphanEvent {
        event_id: String,
        payment_intent_id: String,
    },

    // General
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EmptyCart
            | Self::InvalidQuantity(_)
            | Self::CouponInvalid(_)
            | Self::CouponExpired(_)
            | Self::CouponExhausted(_)
            | Self::OrphanEvent { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InsufficientStock(_)
            | Self::PriceUnavailable(_)
            | Self::ConcurrentModification(_)
            | Self::InvalidTransition { .. }
            | Self::InvalidOperation(_)
            | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PaymentDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::PaymentGatewayTimeout(_) | Self::CheckoutTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::PaymentGatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::BadRequest(_) | Self::InvalidSignature(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::DatabaseError(_) | Self::SerializationError(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable error code for clients and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyCart => "EMPTY_CART",
            Self::InvalidQuantity(_) => "INVALID_QUANTITY",
            Self::CouponInvalid(_) => "COUPON_INVALID",
            Self::CouponExpired(_) => "COUPON_EXPIRED",
            Self::CouponExhausted(_) => "COUPON_EXHAUSTED",
            Self::InsufficientStock(_) => "INSUFFICIENT_STOCK",
            Self::PriceUnavailable(_) => "PRICE_UNAVAILABLE",
            Self::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            Self::PaymentGatewayTimeout(_) => "PAYMENT_GATEWAY_TIMEOUT",
            Self::PaymentGatewayUnavailable(_) => "PAYMENT_GATEWAY_UNAVAILABLE",
            Self::PaymentDeclined { .. } => "PAYMENT_DECLINED",
            Self::CheckoutTimeout => "CHECKOUT_TIMEOUT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::OrphanEvent { .. } => "ORPHAN_EVENT",
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::InvalidSignature(_) => "INVALID_SIGNATURE",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::Conflict(_) => "CONFLICT",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the same request may succeed if the client retries it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientStock(_)
                | Self::PriceUnavailable(_)
                | Self::ConcurrentModification(_)
                | Self::PaymentGatewayTimeout(_)
                | Self::PaymentGatewayUnavailable(_)
                | Self::CheckoutTimeout
                | Self::DatabaseError(_)
        )
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::InternalError(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            kind: self.kind().to_string(),
            message: self.response_message(),
            request_id: current_request_id(),
            retryable: self.is_retryable(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
