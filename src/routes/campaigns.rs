use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::db::{Campaign, CampaignRepository, CreateCampaign};
use crate::error::{AppError, AppResult};
use crate::services::campaigns::CampaignService;
use crate::services::templates::TemplateKey;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_campaign).get(list_campaigns))
        .route("/:id", get(get_campaign))
        .route("/:id/send", post(send_campaign))
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub template: String,
    pub subject: Option<String>,
    pub data: Option<serde_json::Value>,
    pub scheduled_at: Option<NaiveDateTime>,
}

#[derive(Debug, Deserialize)]
pub struct SendCampaignRequest {
    pub recipients: Vec<String>,
}

async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateCampaignRequest>,
) -> AppResult<(StatusCode, Json<Campaign>)> {
    if request.name.trim().is_empty() {
        return Err(AppError::Validation("Campaign name must not be empty".to_string()));
    }

    // Campaigns address templates by exact key; a typo here would otherwise
    // silently fan the whole campaign out through the generic fallback.
    let key = TemplateKey::parse(&request.template)?;

    let campaign = CampaignRepository::create(
        &state.db,
        CreateCampaign {
            name: request.name,
            template_key: key.as_str().to_string(),
            subject: request.subject,
            custom_data: request.data.map(|d| d.to_string()),
            scheduled_at: request.scheduled_at,
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn list_campaigns(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<Campaign>>> {
    let campaigns = CampaignRepository::list(&state.db).await?;
    Ok(Json(campaigns))
}

async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Campaign>> {
    let campaign = CampaignRepository::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Campaign {} not found", id)))?;

    Ok(Json(campaign))
}

/// Fan the campaign out to the supplied recipient list.
async fn send_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SendCampaignRequest>,
) -> AppResult<Json<Campaign>> {
    if request.recipients.is_empty() {
        return Err(AppError::Validation(
            "Campaign send requires at least one recipient".to_string(),
        ));
    }

    let campaign = CampaignService::new(&state).send(&id, &request.recipients).await?;
    Ok(Json(campaign))
}
