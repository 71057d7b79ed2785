use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::db::{CreateEmailTemplate, EmailTemplate, EmailTemplateRepository};
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_templates).post(upsert_template))
        .route("/:slug", get(get_template))
}

#[derive(Debug, Deserialize)]
pub struct UpsertTemplateRequest {
    pub name: Option<String>,
    pub slug: String,
    pub subject: String,
    pub html_content: String,
}

async fn list_templates(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<EmailTemplate>>> {
    let templates = EmailTemplateRepository::list(&state.db).await?;
    Ok(Json(templates))
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> AppResult<Json<EmailTemplate>> {
    let template = EmailTemplateRepository::find_by_slug(&state.db, &slug)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Template '{}' not found", slug)))?;

    Ok(Json(template))
}

/// Create a template row, or replace the subject/body of an existing one.
/// Editing a seeded system template is how admins customize the built-ins.
async fn upsert_template(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpsertTemplateRequest>,
) -> AppResult<(StatusCode, Json<EmailTemplate>)> {
    if request.slug.trim().is_empty() {
        return Err(AppError::Validation("Template slug must not be empty".to_string()));
    }

    let existing = EmailTemplateRepository::find_by_slug(&state.db, &request.slug).await?;

    let (status, template) = match existing {
        Some(_) => {
            let updated = EmailTemplateRepository::update_content(
                &state.db,
                &request.slug,
                &request.subject,
                &request.html_content,
            )
            .await?;
            (StatusCode::OK, updated)
        }
        None => {
            let created = EmailTemplateRepository::create(
                &state.db,
                CreateEmailTemplate {
                    name: request.name.unwrap_or_else(|| request.slug.clone()),
                    slug: request.slug,
                    subject: request.subject,
                    html_content: request.html_content,
                    is_system: false,
                },
            )
            .await?;
            (StatusCode::CREATED, created)
        }
    };

    Ok((status, Json(template)))
}
