use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{
    AutomationStep, AutomationTrigger, AutomationWorkflow, CreateAutomationStep,
    CreateAutomationTrigger, CreateAutomationWorkflow, CreateWorkflowResumption,
    WorkflowResumption,
};
use crate::error::{AppError, AppResult};

const TRIGGER_COLUMNS: &str =
    "id, name, trigger_type, conditions, is_active, created_at, updated_at";
const WORKFLOW_COLUMNS: &str = r#"
    id, trigger_id, name, template_key, delay_minutes, conditions,
    is_active, created_at, updated_at
"#;
const STEP_COLUMNS: &str = "id, workflow_id, step_order, step_type, config, created_at";
const RESUMPTION_COLUMNS: &str = r#"
    id, workflow_id, next_step_order, payload, resume_at, status, created_at, updated_at
"#;

pub struct AutomationTriggerRepository;

impl AutomationTriggerRepository {
    pub async fn create(
        pool: &SqlitePool,
        trigger: CreateAutomationTrigger,
    ) -> AppResult<AutomationTrigger> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, AutomationTrigger>(&format!(
            r#"
            INSERT INTO automation_triggers (
                id, name, trigger_type, conditions, is_active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING {TRIGGER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(trigger.name)
        .bind(trigger.trigger_type)
        .bind(trigger.conditions)
        .bind(trigger.is_active.unwrap_or(true))
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list(pool: &SqlitePool) -> AppResult<Vec<AutomationTrigger>> {
        let rows = sqlx::query_as::<_, AutomationTrigger>(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM automation_triggers ORDER BY created_at ASC"
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn find_active_by_type(
        pool: &SqlitePool,
        trigger_type: &str,
    ) -> AppResult<Vec<AutomationTrigger>> {
        let rows = sqlx::query_as::<_, AutomationTrigger>(&format!(
            r#"
            SELECT {TRIGGER_COLUMNS} FROM automation_triggers
            WHERE trigger_type = ? AND is_active = 1
            ORDER BY created_at ASC
            "#
        ))
        .bind(trigger_type)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}

pub struct AutomationWorkflowRepository;

impl AutomationWorkflowRepository {
    pub async fn create(
        pool: &SqlitePool,
        workflow: CreateAutomationWorkflow,
    ) -> AppResult<AutomationWorkflow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, AutomationWorkflow>(&format!(
            r#"
            INSERT INTO automation_workflows (
                id, trigger_id, name, template_key, delay_minutes,
                conditions, is_active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {WORKFLOW_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(workflow.trigger_id)
        .bind(workflow.name)
        .bind(workflow.template_key)
        .bind(workflow.delay_minutes.unwrap_or(0))
        .bind(workflow.conditions)
        .bind(workflow.is_active.unwrap_or(true))
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<AutomationWorkflow>> {
        let row = sqlx::query_as::<_, AutomationWorkflow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM automation_workflows WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_active_by_trigger(
        pool: &SqlitePool,
        trigger_id: &str,
    ) -> AppResult<Vec<AutomationWorkflow>> {
        let rows = sqlx::query_as::<_, AutomationWorkflow>(&format!(
            r#"
            SELECT {WORKFLOW_COLUMNS} FROM automation_workflows
            WHERE trigger_id = ? AND is_active = 1
            ORDER BY created_at ASC
            "#
        ))
        .bind(trigger_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn list(pool: &SqlitePool) -> AppResult<Vec<AutomationWorkflow>> {
        let rows = sqlx::query_as::<_, AutomationWorkflow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM automation_workflows ORDER BY created_at ASC"
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}

pub struct AutomationStepRepository;

impl AutomationStepRepository {
    pub async fn create(pool: &SqlitePool, step: CreateAutomationStep) -> AppResult<AutomationStep> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, AutomationStep>(&format!(
            r#"
            INSERT INTO automation_steps (
                id, workflow_id, step_order, step_type, config, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(step.workflow_id)
        .bind(step.step_order)
        .bind(step.step_type)
        .bind(step.config)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// All steps of a workflow in execution order.
    pub async fn list_by_workflow(
        pool: &SqlitePool,
        workflow_id: &str,
    ) -> AppResult<Vec<AutomationStep>> {
        let rows = sqlx::query_as::<_, AutomationStep>(&format!(
            r#"
            SELECT {STEP_COLUMNS} FROM automation_steps
            WHERE workflow_id = ?
            ORDER BY step_order ASC
            "#
        ))
        .bind(workflow_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Steps of a workflow at or after `from_order`, in execution order.
    /// Used when resuming after a persisted wait.
    pub async fn list_from(
        pool: &SqlitePool,
        workflow_id: &str,
        from_order: i64,
    ) -> AppResult<Vec<AutomationStep>> {
        let rows = sqlx::query_as::<_, AutomationStep>(&format!(
            r#"
            SELECT {STEP_COLUMNS} FROM automation_steps
            WHERE workflow_id = ? AND step_order >= ?
            ORDER BY step_order ASC
            "#
        ))
        .bind(workflow_id)
        .bind(from_order)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}

pub struct WorkflowResumptionRepository;

impl WorkflowResumptionRepository {
    pub async fn create(
        pool: &SqlitePool,
        resumption: CreateWorkflowResumption,
    ) -> AppResult<WorkflowResumption> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, WorkflowResumption>(&format!(
            r#"
            INSERT INTO workflow_resumptions (
                id, workflow_id, next_step_order, payload, resume_at,
                status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
            RETURNING {RESUMPTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(resumption.workflow_id)
        .bind(resumption.next_step_order)
        .bind(resumption.payload)
        .bind(resumption.resume_at)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Claim up to `limit` due resumptions using the same atomic
    /// update-with-subselect pattern as the send queue.
    pub async fn fetch_and_claim_due(
        pool: &SqlitePool,
        limit: i64,
    ) -> AppResult<Vec<WorkflowResumption>> {
        let mut due: Vec<WorkflowResumption> = Vec::new();
        if limit <= 0 {
            return Ok(due);
        }

        for _ in 0..(limit as usize) {
            let now = Utc::now().naive_utc();

            let opt = sqlx::query_as::<_, WorkflowResumption>(&format!(
                r#"
                UPDATE workflow_resumptions
                SET status = 'processing', updated_at = ?
                WHERE id = (
                    SELECT id FROM workflow_resumptions
                    WHERE status = 'pending' AND resume_at <= ?
                    ORDER BY resume_at ASC
                    LIMIT 1
                )
                RETURNING {RESUMPTION_COLUMNS}
                "#
            ))
            .bind(now)
            .bind(now)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

            if let Some(resumption) = opt {
                due.push(resumption);
            } else {
                break;
            }
        }

        Ok(due)
    }

    pub async fn mark_done(pool: &SqlitePool, id: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query("UPDATE workflow_resumptions SET status = 'done', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn mark_failed(pool: &SqlitePool, id: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            "UPDATE workflow_resumptions SET status = 'failed', updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}
