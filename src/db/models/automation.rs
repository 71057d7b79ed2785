use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A trigger matches inbound events by type plus optional conditions on the
/// event payload. It owns zero or more workflows; each workflow owns an
/// ordered list of steps. The hierarchy is a plain tree.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AutomationTrigger {
    pub id: String,
    pub name: String,
    /// Event type this trigger listens for, e.g. `booking.confirmed`.
    pub trigger_type: String,
    /// JSON condition expression evaluated against the event payload.
    pub conditions: Option<String>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAutomationTrigger {
    pub name: String,
    pub trigger_type: String,
    pub conditions: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AutomationWorkflow {
    pub id: String,
    pub trigger_id: String,
    pub name: String,
    pub template_key: Option<String>,
    pub delay_minutes: i64,
    pub conditions: Option<String>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAutomationWorkflow {
    pub trigger_id: String,
    pub name: String,
    pub template_key: Option<String>,
    pub delay_minutes: Option<i64>,
    pub conditions: Option<String>,
    pub is_active: Option<bool>,
}

/// One unit of workflow execution. `step_type` is one of `send_email`,
/// `wait`, `condition`, `webhook`; unknown types are skipped at run time.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AutomationStep {
    pub id: String,
    pub workflow_id: String,
    pub step_order: i64,
    pub step_type: String,
    pub config: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAutomationStep {
    pub workflow_id: String,
    pub step_order: i64,
    pub step_type: String,
    pub config: Option<String>,
}

/// A parked workflow execution created by a `wait` step.
///
/// Instead of sleeping in-process for the wait duration, the engine persists
/// where it stopped (`next_step_order`) together with the working payload and
/// a `resume_at` timestamp. A background poller re-enters the remaining steps
/// once the row is due.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowResumption {
    pub id: String,
    pub workflow_id: String,
    pub next_step_order: i64,
    pub payload: String,
    pub resume_at: NaiveDateTime,
    /// 'pending', 'done' or 'failed'
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkflowResumption {
    pub workflow_id: String,
    pub next_step_order: i64,
    pub payload: String,
    pub resume_at: NaiveDateTime,
}
