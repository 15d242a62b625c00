use crate::{
    errors::ServiceError,
    handlers::AppState,
    services::reconciliation::{GatewayEvent, ReconciliationService, WebhookEnvelope},
};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use metrics::counter;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// How long a processed event id stays in the redis fast path.
const DEDUP_TTL_SECS: usize = 24 * 3600;

// POST /api/v1/payments/webhook
//
// At-least-once channel: the gateway redelivers on any non-200 answer, so
// everything that is not a malformed payload, a bad signature, or a data
// integrity fault is acknowledged.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Webhook accepted"),
        (status = 400, description = "Malformed payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    counter!("storefront_webhooks.received", 1);

    // Verify signature if configured
    if let Some(secret) = state.config.payment_webhook_secret.clone() {
        let ok = verify_signature(
            &headers,
            &body,
            &secret,
            state.config.payment_webhook_tolerance_secs.unwrap_or(300),
        );
        if !ok {
            warn!("payment webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;

    // Redis fast path for event-id dedup; the durable ledger below is the
    // actual idempotency guarantee.
    if let (Some(redis), Some(event_id)) = (state.redis.as_ref(), envelope.id.as_deref()) {
        let key = format!("wh:{}", event_id);
        if let Ok(mut conn) = redis.get_async_connection().await {
            let fresh: Result<bool, _> = redis::cmd("SET")
                .arg(&key)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(DEDUP_TTL_SECS)
                .query_async(&mut conn)
                .await;
            if let Ok(false) = fresh {
                info!(event_id, "webhook event already processed");
                counter!("storefront_webhooks.processed", 1, "outcome" => "duplicate");
                return Ok(ack());
            }
        }
    }

    let event = match GatewayEvent::classify(&envelope) {
        Ok(Some(event)) => event,
        Ok(None) => {
            info!(event_type = %envelope.event_type, "ignoring unhandled webhook type");
            counter!("storefront_webhooks.processed", 1, "outcome" => "ignored");
            return Ok(ack());
        }
        Err(err) => {
            // A known type whose object no longer parses: the gateway moved
            // under us. Ack so it is not redelivered forever, but make noise.
            warn!(event_type = %envelope.event_type, error = %err, "webhook object failed to parse");
            counter!("storefront_webhooks.processed", 1, "outcome" => "unparseable");
            return Ok(ack());
        }
    };

    let reconciliation =
        ReconciliationService::new(state.db.clone(), Arc::new(state.event_sender.clone()));

    match reconciliation
        .handle_event(envelope.id.as_deref(), &event)
        .await
    {
        Ok(outcome) => {
            counter!("storefront_webhooks.processed", 1, "outcome" => outcome.as_str());
        }
        Err(err @ ServiceError::IntegrityFault(_)) => return Err(err),
        Err(err) => {
            error!(error = %err, "webhook reconciliation failed; acking to avoid a redelivery storm");
            counter!("storefront_webhooks.errors", 1);
        }
    }

    Ok(ack())
}

fn ack() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({ "received": true })))
}

fn verify_signature(headers: &HeaderMap, payload: &Bytes, secret: &str, tolerance_secs: u64) -> bool {
    // Generic HMAC: x-timestamp and x-signature headers
    if let (Some(ts), Some(sig)) = (headers.get("x-timestamp"), headers.get("x-signature")) {
        if let (Ok(ts), Ok(sig)) = (ts.to_str(), sig.to_str()) {
            if let Ok(ts_i) = ts.parse::<i64>() {
                let now = chrono::Utc::now().timestamp();
                if (now - ts_i).unsigned_abs() > tolerance_secs {
                    return false;
                }
            }
            return signature_matches(secret, ts, payload, sig);
        }
    }

    // Stripe-like support: Stripe-Signature with t=, v1=
    if let Some(sig) = headers.get("Stripe-Signature").and_then(|h| h.to_str().ok()) {
        let mut ts = "";
        let mut v1 = "";
        for part in sig.split(',') {
            let mut it = part.split('=');
            match (it.next(), it.next()) {
                (Some("t"), Some(val)) => ts = val,
                (Some("v1"), Some(val)) => v1 = val,
                _ => {}
            }
        }
        if !ts.is_empty() && !v1.is_empty() {
            return signature_matches(secret, ts, payload, v1);
        }
    }

    false
}

fn signature_matches(secret: &str, timestamp: &str, payload: &[u8], signature: &str) -> bool {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(&expected, signature)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
