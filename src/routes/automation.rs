use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::{
    AutomationStep, AutomationStepRepository, AutomationTrigger, AutomationTriggerRepository,
    AutomationWorkflow, AutomationWorkflowRepository, CreateAutomationStep,
    CreateAutomationTrigger, CreateAutomationWorkflow,
};
use crate::error::{AppError, AppResult};
use crate::services::automation::Condition;
use crate::services::templates::TemplateKey;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/triggers", post(create_trigger).get(list_triggers))
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/:id/steps", post(create_step).get(list_steps))
}

#[derive(Debug, Deserialize)]
pub struct CreateTriggerRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub trigger_type: String,
    pub conditions: Option<serde_json::Value>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub trigger_id: String,
    pub name: String,
    pub template: Option<String>,
    pub delay_minutes: Option<i64>,
    pub conditions: Option<serde_json::Value>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateStepRequest {
    pub order: i64,
    #[serde(rename = "type")]
    pub step_type: String,
    pub config: Option<serde_json::Value>,
}

/// Reject conditions that would silently never match at event time.
fn validate_conditions(conditions: &Option<serde_json::Value>) -> AppResult<Option<String>> {
    match conditions {
        None => Ok(None),
        Some(value) => {
            Condition::from_json(value)?;
            Ok(Some(value.to_string()))
        }
    }
}

async fn create_trigger(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTriggerRequest>,
) -> AppResult<(StatusCode, Json<AutomationTrigger>)> {
    if request.trigger_type.trim().is_empty() {
        return Err(AppError::Validation("Trigger type must not be empty".to_string()));
    }

    let conditions = validate_conditions(&request.conditions)?;

    let trigger = AutomationTriggerRepository::create(
        &state.db,
        CreateAutomationTrigger {
            name: request.name,
            trigger_type: request.trigger_type,
            conditions,
            is_active: request.is_active,
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(trigger)))
}

async fn list_triggers(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<AutomationTrigger>>> {
    let triggers = AutomationTriggerRepository::list(&state.db).await?;
    Ok(Json(triggers))
}

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateWorkflowRequest>,
) -> AppResult<(StatusCode, Json<AutomationWorkflow>)> {
    let conditions = validate_conditions(&request.conditions)?;

    // Workflows address templates by exact key, same contract as campaigns.
    let template_key = match request.template {
        Some(template) => Some(TemplateKey::parse(&template)?.as_str().to_string()),
        None => None,
    };

    let workflow = AutomationWorkflowRepository::create(
        &state.db,
        CreateAutomationWorkflow {
            trigger_id: request.trigger_id,
            name: request.name,
            template_key,
            delay_minutes: request.delay_minutes,
            conditions,
            is_active: request.is_active,
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<AutomationWorkflow>>> {
    let workflows = AutomationWorkflowRepository::list(&state.db).await?;
    Ok(Json(workflows))
}

async fn create_step(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(request): Json<CreateStepRequest>,
) -> AppResult<(StatusCode, Json<AutomationStep>)> {
    AutomationWorkflowRepository::find_by_id(&state.db, &workflow_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Workflow {} not found", workflow_id)))?;

    // Unknown step types are tolerated at run time (logged and skipped), but
    // creating one is almost certainly a typo, so flag it here.
    if !matches!(
        request.step_type.as_str(),
        "send_email" | "wait" | "condition" | "webhook"
    ) {
        return Err(AppError::Validation(format!(
            "Unknown step type '{}'",
            request.step_type
        )));
    }

    let step = AutomationStepRepository::create(
        &state.db,
        CreateAutomationStep {
            workflow_id,
            step_order: request.order,
            step_type: request.step_type,
            config: request.config.map(|c| c.to_string()),
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(step)))
}

async fn list_steps(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> AppResult<Json<Vec<AutomationStep>>> {
    let steps = AutomationStepRepository::list_by_workflow(&state.db, &workflow_id).await?;
    Ok(Json(steps))
}
