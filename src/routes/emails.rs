use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::{
    CreateScheduledEmail, DeliveryRecord, DeliveryRecordRepository, ScheduledEmail,
    ScheduledEmailRepository,
};
use crate::error::{AppError, AppResult};
use crate::services::emails::{EmailService, SendEmailRequest};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(send_email).get(list_emails))
        .route("/stats", get(get_email_stats))
        .route("/schedule", post(schedule_email))
        .route("/scheduled", get(list_scheduled))
        .route("/:id", get(get_email))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct EnqueuedResponse {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ListEmailsQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub status: Option<String>,
    pub template: Option<String>,
    pub recipient: Option<String>,
    pub campaign_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EmailsListResponse {
    pub items: Vec<DeliveryRecord>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
pub struct EmailStatsResponse {
    pub total_pending: i64,
    pub total_sent: i64,
    pub total_failed: i64,
    pub by_template: std::collections::HashMap<String, i64>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleEmailRequest {
    pub to: String,
    pub template: String,
    pub data: Option<serde_json::Value>,
    pub subject: Option<String>,
    pub scheduled_at: NaiveDateTime,
}

// ============================================================================
// Handlers
// ============================================================================

/// Accept a send request and enqueue it. The returned id identifies the
/// delivery record; the actual SMTP handoff happens asynchronously.
async fn send_email(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendEmailRequest>,
) -> AppResult<(StatusCode, Json<EnqueuedResponse>)> {
    let record = EmailService::new(&state).enqueue(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueuedResponse {
            id: record.id,
            status: record.status,
        }),
    ))
}

/// List delivery records with optional filters.
async fn list_emails(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListEmailsQuery>,
) -> AppResult<Json<EmailsListResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * per_page;

    let items = DeliveryRecordRepository::list_with_filters(
        &state.db,
        per_page,
        offset,
        query.status.as_deref(),
        query.template.as_deref(),
        query.recipient.as_deref(),
        query.campaign_id.as_deref(),
    )
    .await?;

    let total = DeliveryRecordRepository::count_with_filters(
        &state.db,
        query.status.as_deref(),
        query.template.as_deref(),
        query.recipient.as_deref(),
        query.campaign_id.as_deref(),
    )
    .await?;

    let total_pages = (total as f64 / per_page as f64).ceil() as i64;

    Ok(Json(EmailsListResponse {
        items,
        total,
        page,
        per_page,
        total_pages,
    }))
}

/// Aggregate delivery statistics.
async fn get_email_stats(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<EmailStatsResponse>> {
    let db = state.db.clone();

    let (total_pending, total_sent, total_failed, by_template) = tokio::try_join!(
        {
            let db = db.clone();
            async move { DeliveryRecordRepository::count_by_status(&db, "pending").await }
        },
        {
            let db = db.clone();
            async move { DeliveryRecordRepository::count_by_status(&db, "sent").await }
        },
        {
            let db = db.clone();
            async move { DeliveryRecordRepository::count_by_status(&db, "failed").await }
        },
        {
            let db = db.clone();
            async move { DeliveryRecordRepository::counts_by_template(&db).await }
        }
    )?;

    Ok(Json(EmailStatsResponse {
        total_pending,
        total_sent,
        total_failed,
        by_template,
    }))
}

async fn get_email(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<DeliveryRecord>> {
    let record = DeliveryRecordRepository::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Delivery record {} not found", id)))?;

    Ok(Json(record))
}

/// Defer a send until `scheduled_at`; the sweeper promotes it when due.
async fn schedule_email(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ScheduleEmailRequest>,
) -> AppResult<(StatusCode, Json<ScheduledEmail>)> {
    request.to.parse::<lettre::Address>()?;

    let scheduled = ScheduledEmailRepository::create(
        &state.db,
        CreateScheduledEmail {
            recipient_email: request.to,
            template_slug: request.template,
            template_data: request.data.map(|d| d.to_string()),
            subject: request.subject,
            scheduled_at: request.scheduled_at,
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(scheduled)))
}

async fn list_scheduled(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListEmailsQuery>,
) -> AppResult<Json<Vec<ScheduledEmail>>> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(50).clamp(1, 200);
    let offset = (page - 1) * per_page;

    let rows = ScheduledEmailRepository::list(&state.db, per_page, offset).await?;
    Ok(Json(rows))
}
