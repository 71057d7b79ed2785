use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::{DeliveryRecordRepository, DeliveryStatus};
use crate::error::{AppError, AppResult};
use crate::AppState;

/// Smallest valid transparent 1x1 GIF.
const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/open/:id", get(track_open))
        .route("/click/:id", get(track_click))
        .route("/delivered", post(track_delivered))
        .route("/bounce", post(track_bounce))
}

/// Advance a record's engagement status, tolerating repeats.
///
/// Opens and clicks arrive as often as the mail client re-renders the
/// message; a transition the record has already passed is expected, not an
/// error. Genuine failures are logged and swallowed too: tracking must never
/// break the pixel or the redirect for the reader.
async fn advance_engagement(state: &Arc<AppState>, id: &str, next: DeliveryStatus) {
    match DeliveryRecordRepository::advance_status(&state.db, id, next, None).await {
        Ok(_) => {
            tracing::debug!(record = %id, status = next.as_str(), "Engagement recorded");
        }
        Err(AppError::Conflict(_)) => {
            tracing::debug!(record = %id, status = next.as_str(), "Engagement already recorded");
        }
        Err(e) => {
            tracing::warn!(record = %id, "Failed to record engagement: {:?}", e);
        }
    }
}

/// Tracking pixel: marks the record opened and serves a 1x1 GIF regardless.
async fn track_open(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    advance_engagement(&state, &id, DeliveryStatus::Opened).await;

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, max-age=0"),
        ],
        PIXEL_GIF,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ClickQuery {
    pub url: String,
}

/// Click redirect: marks the record clicked, then forwards to the target.
async fn track_click(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ClickQuery>,
) -> AppResult<Redirect> {
    let target = urlencoding::decode(&query.url)
        .map_err(|_| AppError::BadRequest("Invalid redirect url encoding".to_string()))?
        .into_owned();

    if !target.starts_with("http://") && !target.starts_with("https://") {
        return Err(AppError::BadRequest("Redirect url must be absolute".to_string()));
    }

    advance_engagement(&state, &id, DeliveryStatus::Clicked).await;

    Ok(Redirect::temporary(&target))
}

#[derive(Debug, Deserialize)]
pub struct DeliveryCallback {
    /// Transport message id as reported by the relay.
    pub message_id: String,
}

/// Relay delivery confirmation: flips the matching record to `delivered`.
async fn track_delivered(
    State(state): State<Arc<AppState>>,
    Json(callback): Json<DeliveryCallback>,
) -> AppResult<StatusCode> {
    let record =
        DeliveryRecordRepository::find_by_message_id(&state.db, &callback.message_id).await?;

    let Some(record) = record else {
        return Err(AppError::NotFound(format!(
            "No delivery record for message id {}",
            callback.message_id
        )));
    };

    advance_engagement(&state, &record.id, DeliveryStatus::Delivered).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct BounceCallback {
    /// Transport message id as reported by the relay.
    pub message_id: String,
    pub reason: Option<String>,
}

/// Relay bounce callback: flips the matching record to `bounced`.
async fn track_bounce(
    State(state): State<Arc<AppState>>,
    Json(callback): Json<BounceCallback>,
) -> AppResult<StatusCode> {
    let record =
        DeliveryRecordRepository::find_by_message_id(&state.db, &callback.message_id).await?;

    let Some(record) = record else {
        return Err(AppError::NotFound(format!(
            "No delivery record for message id {}",
            callback.message_id
        )));
    };

    DeliveryRecordRepository::advance_status(
        &state.db,
        &record.id,
        DeliveryStatus::Bounced,
        callback.reason.as_deref(),
    )
    .await?;

    tracing::info!(record = %record.id, "Delivery bounced");
    Ok(StatusCode::NO_CONTENT)
}
