//! Payment gateway adapter.
//!
//! Only intent creation goes out to the gateway; confirmations come back
//! through the webhook. A synchronous decline is a normal answer, not a
//! failure, so it never trips the circuit breaker.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::errors::ServiceError;
use crate::models::PaymentIntent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRequest {
    pub order_id: Uuid,
    /// Grand total in minor units.
    pub amount: i64,
    pub currency: String,
    /// Forwarded so the gateway deduplicates retried intent requests.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOutcome {
    Created(PaymentIntent),
    Declined { reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("payment gateway timed out")]
    Timeout,
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    pub fn into_service_error(self, order_id: Uuid) -> ServiceError {
        match self {
            GatewayError::Timeout => ServiceError::PaymentGatewayTimeout(order_id),
            GatewayError::Unavailable(reason) => ServiceError::PaymentGatewayUnavailable(reason),
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(&self, request: &IntentRequest) -> Result<IntentOutcome, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct DeclineResponse {
    #[serde(default)]
    decline_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP adapter: `POST {base_url}/v1/payment_intents`.
#[derive(Debug)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    breaker: CircuitBreaker,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
        breaker: CircuitBreakerConfig,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("gateway client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            breaker: CircuitBreaker::new("payment_gateway", breaker),
        })
    }

    async fn send(&self, request: &IntentRequest) -> Result<IntentOutcome, GatewayError> {
        let url = format!("{}/v1/payment_intents", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&serde_json::json!({
                "amount": request.amount,
                "currency": request.currency.to_ascii_lowercase(),
                "metadata": { "order_id": request.order_id },
            }));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            let intent: IntentResponse = response
                .json()
                .await
                .map_err(|e| GatewayError::Unavailable(format!("malformed intent response: {e}")))?;
            debug!(order_id = %request.order_id, payment_intent_id = %intent.id, "intent created");
            return Ok(IntentOutcome::Created(PaymentIntent {
                id: intent.id,
                client_secret: intent.client_secret,
            }));
        }

        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            let decline: DeclineResponse = response.json().await.unwrap_or(DeclineResponse {
                decline_code: None,
                message: None,
            });
            let reason = decline
                .decline_code
                .or(decline.message)
                .unwrap_or_else(|| "declined".to_string());
            return Ok(IntentOutcome::Declined { reason });
        }

        warn!(order_id = %request.order_id, %status, "payment gateway error");
        Err(GatewayError::Unavailable(format!("gateway returned {status}")))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_intent(&self, request: &IntentRequest) -> Result<IntentOutcome, GatewayError> {
        self.breaker
            .call(|| self.send(request))
            .await
            .map_err(|e| match e {
                CircuitBreakerError::CircuitOpen => {
                    GatewayError::Unavailable("circuit breaker open".to_string())
                }
                CircuitBreakerError::Inner(inner) => inner,
            })
    }
}

/// Accepts every intent. Stands in for a real gateway in development.
#[derive(Debug, Default)]
pub struct SimulatedGateway;

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn create_intent(&self, request: &IntentRequest) -> Result<IntentOutcome, GatewayError> {
        let id = format!("pi_{}", Uuid::new_v4().simple());
        let suffix: String = request.idempotency_key.chars().take(8).collect();
        let client_secret = format!("{id}_secret_{suffix}");
        Ok(IntentOutcome::Created(PaymentIntent { id, client_secret }))
    }
}
