//! The webhook admission endpoint.
//!
//! `POST /webhooks/{host}` verifies the HMAC-SHA-256 signature over the raw
//! body (constant-time compare), enforces the body cap, reserves the
//! delivery id, and publishes the event to the durable stream. Status codes
//! are deterministic:
//!
//! | Condition | Status |
//! |---|---|
//! | admitted | 202 |
//! | delivery id already seen | 200 duplicate |
//! | body unparseable / header missing | 400 |
//! | signature mismatch | 401 |
//! | body over the cap | 413 |
//! | stream slow or consumer backlogged | 503 |

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use chrono::Utc;
use gitguard_dedup::Reservation;
use gitguard_metrics::EVENTS_TOTAL;
use gitguard_types::EventKind;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::ServerState;

type HmacSha256 = Hmac<Sha256>;

/// Router for the admission endpoint.
pub fn router(state: Arc<ServerState>) -> Router {
    let body_cap = state.pipeline.config.body_max_bytes;
    Router::new()
        .route("/webhooks/:host", post(webhook))
        // The exact boundary check is ours; the framework cap just has to
        // sit above it.
        .layer(DefaultBodyLimit::max(body_cap.saturating_mul(2).max(1024)))
        .with_state(state)
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, axum::Json(body)).into_response()
}

fn error_reply(status: StatusCode, code: &str, message: &str) -> Response {
    reply(
        status,
        json!({"error": {"code": code, "message": message, "request_id": uuid::Uuid::new_v4().to_string()}}),
    )
}

async fn webhook(
    State(state): State<Arc<ServerState>>,
    Path(host): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = &state.pipeline.config;

    if body.len() > config.body_max_bytes {
        return error_reply(
            StatusCode::PAYLOAD_TOO_LARGE,
            "too_large",
            &format!("body exceeds {} bytes", config.body_max_bytes),
        );
    }

    let Some(signature) = header(&headers, "X-Signature-256") else {
        return error_reply(StatusCode::BAD_REQUEST, "malformed", "missing X-Signature-256");
    };
    let Some(kind_header) = header(&headers, "X-Event-Kind") else {
        return error_reply(StatusCode::BAD_REQUEST, "malformed", "missing X-Event-Kind");
    };
    let Some(delivery_id) = header(&headers, "X-Delivery-ID") else {
        return error_reply(StatusCode::BAD_REQUEST, "malformed", "missing X-Delivery-ID");
    };

    if !verify_signature(&config.signing_secret, &body, &signature) {
        return error_reply(StatusCode::UNAUTHORIZED, "unauthorized", "signature mismatch");
    }

    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            return error_reply(
                StatusCode::BAD_REQUEST,
                "malformed",
                &format!("body is not valid JSON: {}", e),
            );
        }
    };
    let Ok(kind) = kind_header.parse::<EventKind>() else {
        return error_reply(
            StatusCode::BAD_REQUEST,
            "malformed",
            &format!("unsupported event kind: {}", kind_header),
        );
    };

    // Backpressure: refuse before doing work when the consumer is drowning.
    let pending = state.consumer.pending();
    if pending > config.ingress.max_pending {
        return error_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            "backpressure",
            &format!("consumer backlog {} over limit", pending),
        );
    }

    let digest = hex::encode(Sha256::digest(&body));
    match state.pipeline.dedup.reserve(&delivery_id, kind.as_str(), &digest) {
        Ok(Reservation::New) => {}
        Ok(Reservation::Seen) => {
            tracing::debug!(%delivery_id, "duplicate delivery");
            return reply(StatusCode::OK, json!({"status": "duplicate"}));
        }
        Err(e) => {
            return error_reply(
                StatusCode::SERVICE_UNAVAILABLE,
                "backpressure",
                &format!("dedup ledger unavailable: {}", e),
            );
        }
    }

    let action = raw
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or(default_action(kind))
        .to_string();
    let subject = format!("gh.{}.{}", kind.as_str(), action);
    let message = json!({
        "delivery_id": delivery_id,
        "kind": kind.as_str(),
        "action": action,
        "received_at": Utc::now().to_rfc3339(),
        "host": host,
        "raw": raw,
    });

    let publish_started = Instant::now();
    let seq = match state.pipeline.stream.publish(&subject, message) {
        Ok(seq) => seq,
        Err(e) => {
            // The event never reached the stream: release the reservation
            // so the host's retry is admitted rather than deduplicated.
            if let Err(release_err) = state.pipeline.dedup.release(&delivery_id) {
                tracing::error!(%delivery_id, error = %release_err, "failed to release reservation");
            }
            state
                .pipeline
                .metrics
                .inc_counter(EVENTS_TOTAL, &[("result", "error")], 1.0);
            return error_reply(
                StatusCode::SERVICE_UNAVAILABLE,
                "backpressure",
                &format!("stream publish failed: {}", e),
            );
        }
    };
    let publish_latency = publish_started.elapsed();
    if publish_latency > config.ingress.backpressure {
        // Enqueued, but the stream is slow: tell the host to back off. Its
        // retry dedups to 200.
        tracing::warn!(
            latency_ms = publish_latency.as_millis() as u64,
            "stream publish exceeded the backpressure budget"
        );
        return error_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            "backpressure",
            "stream publish latency over budget",
        );
    }

    tracing::info!(%delivery_id, %subject, seq, "event admitted");
    reply(StatusCode::ACCEPTED, json!({"status": "accepted", "seq": seq}))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Constant-time signature verification of `sha256=<hex>` over the raw body.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_part) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    // Mac::verify_slice is the constant-time compare.
    mac.verify_slice(&expected).is_ok()
}

/// Compute the signature header value for a body. Used by tests and the
/// demo sender.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn default_action(kind: EventKind) -> &'static str {
    match kind {
        EventKind::PullRequest => "opened",
        EventKind::Push => "push",
        EventKind::Review => "submitted",
        EventKind::CheckRun => "completed",
        EventKind::Release => "published",
        EventKind::Ping => "ping",
    }
}
