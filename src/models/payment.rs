use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use super::order::OrderStatus;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentEventKind {
    Succeeded,
    Failed,
    Refunded,
}

/// A verified gateway event, already translated from the gateway's wire
/// envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Gateway-assigned id, unique per gateway.
    pub id: String,
    pub kind: PaymentEventKind,
    pub payment_intent_id: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    /// The event moved the order to a new status.
    Applied,
    /// The order was already terminal; nothing changed.
    NoOp,
    /// The state machine refused the transition for the order's current
    /// status.
    Rejected,
}

/// Result of reconciling one event. Stored with the dedup record and handed
/// back verbatim on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub event_id: String,
    pub order_id: Uuid,
    pub disposition: Disposition,
    pub order_status: OrderStatus,
    #[serde(default)]
    pub detail: Option<String>,
    /// Set when this outcome came from the dedup store rather than a fresh
    /// run.
    #[serde(default)]
    pub replayed: bool,
}

impl ReconciliationOutcome {
    pub fn as_replay(mut self) -> Self {
        self.replayed = true;
        self
    }
}

/// Dedup record for a processed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub kind: PaymentEventKind,
    pub payment_intent_id: String,
    pub payload: serde_json::Value,
    pub outcome: ReconciliationOutcome,
    pub processed_at: DateTime<Utc>,
}

/// An event whose payment intent matched no order when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanEvent {
    pub event: PaymentEvent,
    pub recorded_at: DateTime<Utc>,
}
