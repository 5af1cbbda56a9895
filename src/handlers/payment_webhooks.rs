use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use crate::errors::ServiceError;
use crate::models::{PaymentEvent, PaymentEventKind, ReconciliationOutcome};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";
pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    /// `processed`, `replayed`, `orphaned` or `ignored`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReconciliationOutcome>,
}

impl WebhookResponse {
    fn bare(status: &str) -> Json<Self> {
        Json(Self {
            status: status.to_string(),
            outcome: None,
        })
    }
}

// POST /api/v1/payments/webhook
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_webhook(&state, &headers, &body).await {
        Ok(response) => response,
        Err(e) if e.is_retryable() => {
            // Non-2xx makes the gateway redeliver later.
            warn!(error = %e, "payment webhook failed transiently");
            let mut response = e.into_response();
            *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            response
        }
        Err(e) => e.into_response(),
    }
}

async fn handle_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ServiceError> {
    let now = Utc::now();
    match state.config.payment_webhook_secret.as_deref() {
        Some(secret) => verify_signature(
            headers,
            body,
            secret,
            state.config.payment_webhook_tolerance_secs,
            now.timestamp(),
        )
        .inspect_err(|e| warn!(error = %e, "payment webhook signature verification failed"))?,
        None => debug!("no webhook secret configured, skipping signature verification"),
    }

    let Some(event) = translate_event(body, now)? else {
        return Ok((StatusCode::OK, WebhookResponse::bare("ignored")).into_response());
    };

    match state.reconciler.handle_event(event).await {
        Ok(outcome) => {
            let status = if outcome.replayed { "replayed" } else { "processed" };
            Ok((
                StatusCode::OK,
                Json(WebhookResponse {
                    status: status.to_string(),
                    outcome: Some(outcome),
                }),
            )
                .into_response())
        }
        Err(ServiceError::OrphanEvent { .. }) => {
            Ok((StatusCode::OK, WebhookResponse::bare("orphaned")).into_response())
        }
        Err(e) => {
            if !e.is_retryable() {
                error!(error = %e, "payment webhook could not be applied");
            }
            Err(e)
        }
    }
}

/// Hex HMAC-SHA256 of `"{timestamp}.{body}"`, as the gateway signs it.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, ServiceError> {
    let mut mac = new_mac(secret)?;
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn new_mac(secret: &str) -> Result<HmacSha256, ServiceError> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("webhook secret: {e}")))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Accepts either `x-timestamp` + `x-signature`, or a Stripe-style
/// `Stripe-Signature: t=...,v1=...` header. The timestamp must be within
/// `tolerance_secs` of `now`.
pub fn verify_signature(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), ServiceError> {
    let (timestamp, candidates): (&str, Vec<&str>) =
        match (header(headers, TIMESTAMP_HEADER), header(headers, SIGNATURE_HEADER)) {
            (Some(ts), Some(sig)) => (ts, vec![sig]),
            _ => {
                let stripe = header(headers, STRIPE_SIGNATURE_HEADER).ok_or_else(|| {
                    ServiceError::InvalidSignature("missing signature headers".to_string())
                })?;
                let mut timestamp = None;
                let mut signatures = Vec::new();
                for part in stripe.split(',') {
                    match part.trim().split_once('=') {
                        Some(("t", value)) => timestamp = Some(value),
                        Some(("v1", value)) => signatures.push(value),
                        _ => {}
                    }
                }
                let timestamp = timestamp.ok_or_else(|| {
                    ServiceError::InvalidSignature("signature header has no timestamp".to_string())
                })?;
                (timestamp, signatures)
            }
        };

    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| ServiceError::InvalidSignature("malformed timestamp".to_string()))?;
    if now.abs_diff(ts) > tolerance_secs {
        return Err(ServiceError::InvalidSignature(
            "timestamp outside tolerance".to_string(),
        ));
    }

    let mut signed = Vec::with_capacity(timestamp.len() + 1 + body.len());
    signed.extend_from_slice(timestamp.trim().as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(body);

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate.trim()) else {
            continue;
        };
        let mut mac = new_mac(secret)?;
        mac.update(&signed);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(ServiceError::InvalidSignature(
        "signature mismatch".to_string(),
    ))
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payment_intent_id: Option<String>,
    #[serde(default)]
    data: Option<EnvelopeData>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: EnvelopeObject,
}

#[derive(Debug, Deserialize)]
struct EnvelopeObject {
    #[serde(default)]
    id: Option<String>,
    /// Charges reference their intent here rather than in `id`.
    #[serde(default)]
    payment_intent: Option<String>,
}

/// Stripe sends a `charge.*` event alongside every `payment_intent.*` one.
/// Only the intent family drives success and failure; refunds exist only
/// on the charge.
fn event_kind(event_type: &str) -> Option<PaymentEventKind> {
    match event_type {
        "payment_intent.succeeded" | "payment.succeeded" => Some(PaymentEventKind::Succeeded),
        "payment_intent.payment_failed" | "payment.failed" => Some(PaymentEventKind::Failed),
        "charge.refunded" | "payment.refunded" => Some(PaymentEventKind::Refunded),
        _ => None,
    }
}

/// Translates a gateway payload into a [`PaymentEvent`]. Event types the
/// service does not act on come back as `None`.
pub fn translate_event(
    body: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Option<PaymentEvent>, ServiceError> {
    let payload: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid json: {e}")))?;
    let envelope: Envelope = serde_json::from_value(payload.clone())
        .map_err(|e| ServiceError::BadRequest(format!("invalid webhook envelope: {e}")))?;

    let Some(kind) = event_kind(&envelope.event_type) else {
        info!(event_id = %envelope.id, event_type = %envelope.event_type, "ignoring unsupported payment event");
        return Ok(None);
    };

    let payment_intent_id = envelope
        .payment_intent_id
        .or_else(|| {
            envelope.data.and_then(|data| {
                if envelope.event_type.starts_with("charge.") {
                    data.object.payment_intent.or(data.object.id)
                } else {
                    data.object.id
                }
            })
        })
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            ServiceError::BadRequest(format!(
                "event {} does not reference a payment intent",
                envelope.id
            ))
        })?;

    if envelope.id.is_empty() {
        return Err(ServiceError::BadRequest("event id is empty".to_string()));
    }

    Ok(Some(PaymentEvent {
        id: envelope.id,
        kind,
        payment_intent_id,
        payload,
        received_at,
    }))
}
