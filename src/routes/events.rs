use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Json, Router};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{AppError, AppResult};
use crate::services::automation::{AutomationEngine, EventOutcome};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

const EVENT_SIGNATURE_HEADER: &str = "x-event-signature";
const EVENT_TIMESTAMP_HEADER: &str = "x-event-timestamp";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(ingest_event))
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn get_header(headers: &HeaderMap, name: &str) -> AppResult<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest(format!("Missing header: {}", name)))
}

/// Verify the HMAC-SHA256 signature over `timestamp.body`.
///
/// The signature header carries `sha256=<hex>`. Signed requests older than
/// ten minutes are rejected to limit replays.
fn verify_signature(secret: &str, timestamp: &str, body: &[u8], signature: &str) -> AppResult<()> {
    let mut message = Vec::with_capacity(timestamp.len() + 1 + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'.');
    message.extend_from_slice(body);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Internal(anyhow::anyhow!("Failed to create HMAC")))?;
    mac.update(&message);

    let expected = if let Some(hex_sig) = signature.strip_prefix("sha256=") {
        hex::decode(hex_sig)
            .map_err(|_| AppError::BadRequest("Invalid signature format".to_string()))?
    } else {
        return Err(AppError::BadRequest("Invalid signature format".to_string()));
    };

    mac.verify_slice(&expected).map_err(|_| AppError::Unauthorized)?;

    if let Ok(event_time) = chrono::DateTime::parse_from_rfc3339(timestamp) {
        let diff = chrono::Utc::now().signed_duration_since(event_time);
        if diff.num_minutes().abs() > 10 {
            return Err(AppError::BadRequest("Event too old".to_string()));
        }
    }

    Ok(())
}

/// Accept an automation event and run matching triggers.
///
/// When `EVENTS_SIGNING_SECRET` is configured the request must carry a valid
/// signature; without the secret the endpoint is open (rate limiting still
/// applies at the router layer).
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<EventOutcome>> {
    if let Some(secret) = &state.config.events.signing_secret {
        let timestamp = get_header(&headers, EVENT_TIMESTAMP_HEADER)?;
        let signature = get_header(&headers, EVENT_SIGNATURE_HEADER)?;
        verify_signature(secret, &timestamp, &body, &signature)?;
    }

    let envelope: EventEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid event body: {}", e)))?;

    tracing::info!(event_type = %envelope.event_type, "Automation event received");

    let outcome = AutomationEngine::new(&state)
        .handle_event(&envelope.event_type, envelope.payload)
        .await?;

    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_a_correctly_signed_event() {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let body = br#"{"type":"booking.confirmed","payload":{}}"#;
        let signature = sign("secret", &timestamp, body);

        assert!(verify_signature("secret", &timestamp, body, &signature).is_ok());
    }

    #[test]
    fn rejects_wrong_secret_and_tampered_body() {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let body = br#"{"type":"booking.confirmed","payload":{}}"#;
        let signature = sign("secret", &timestamp, body);

        assert!(matches!(
            verify_signature("other", &timestamp, body, &signature),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            verify_signature("secret", &timestamp, b"{}", &signature),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn rejects_malformed_signature_and_stale_timestamp() {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let body = b"{}";

        assert!(matches!(
            verify_signature("secret", &timestamp, body, "md5=abc"),
            Err(AppError::BadRequest(_))
        ));

        let stale = (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let signature = sign("secret", &stale, body);
        assert!(matches!(
            verify_signature("secret", &stale, body, &signature),
            Err(AppError::BadRequest(_))
        ));
    }
}
