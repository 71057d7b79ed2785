use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::db::{
    AutomationStep, AutomationStepRepository, AutomationTriggerRepository, AutomationWorkflow,
    AutomationWorkflowRepository, CreateWorkflowResumption, WorkflowResumption,
    WorkflowResumptionRepository,
};
use crate::error::{AppError, AppResult};
use crate::services::emails::{EmailService, SendEmailRequest};
use crate::AppState;

/// Condition expression evaluated against an event payload.
///
/// The tagged forms cover equality, membership, numeric ranges and boolean
/// composition. A bare JSON object like `{"status": "confirmed"}` is still
/// accepted and treated as an implicit `all` of per-key equality checks,
/// which is the shape older triggers were stored in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Equals {
        field: String,
        value: Value,
    },
    OneOf {
        field: String,
        values: Vec<Value>,
    },
    Range {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    All {
        conditions: Vec<Condition>,
    },
    Any {
        conditions: Vec<Condition>,
    },
}

impl Condition {
    /// Parse a condition from its JSON representation. `Ok(None)` means
    /// "no condition", i.e. always matches.
    pub fn from_json(value: &Value) -> AppResult<Option<Condition>> {
        match value {
            Value::Null => Ok(None),
            Value::Object(map) if map.contains_key("op") => {
                let condition = serde_json::from_value(value.clone()).map_err(|e| {
                    AppError::BadRequest(format!("Invalid condition expression: {}", e))
                })?;
                Ok(Some(condition))
            }
            Value::Object(map) => {
                if map.is_empty() {
                    return Ok(None);
                }
                let conditions = map
                    .iter()
                    .map(|(field, value)| Condition::Equals {
                        field: field.clone(),
                        value: value.clone(),
                    })
                    .collect();
                Ok(Some(Condition::All { conditions }))
            }
            _ => Err(AppError::BadRequest(
                "Condition must be a JSON object".to_string(),
            )),
        }
    }

    /// Parse the `conditions` column of a trigger or workflow row.
    pub fn parse_stored(stored: Option<&str>) -> AppResult<Option<Condition>> {
        let Some(raw) = stored else {
            return Ok(None);
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| AppError::BadRequest(format!("Conditions are not valid JSON: {}", e)))?;
        Self::from_json(&value)
    }

    pub fn evaluate(&self, payload: &Value) -> bool {
        match self {
            Condition::Equals { field, value } => payload.get(field) == Some(value),
            Condition::OneOf { field, values } => payload
                .get(field)
                .map_or(false, |actual| values.contains(actual)),
            Condition::Range { field, min, max } => {
                payload.get(field).and_then(Value::as_f64).map_or(false, |n| {
                    min.map_or(true, |m| n >= m) && max.map_or(true, |m| n <= m)
                })
            }
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(payload)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(payload)),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct EventOutcome {
    pub triggers_matched: usize,
    pub workflows_run: usize,
}

/// Evaluates trigger → workflow → step chains against inbound events.
///
/// Failure isolation follows the hierarchy: a failing step aborts the rest of
/// its own workflow execution, a failing workflow never affects sibling
/// workflows or other triggers, and everything is logged rather than bubbled
/// to the event producer.
pub struct AutomationEngine {
    pool: SqlitePool,
    emails: EmailService,
    http: reqwest::Client,
}

impl AutomationEngine {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            pool: state.db.clone(),
            emails: EmailService::new(state),
            http: reqwest::Client::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(pool: SqlitePool, emails: EmailService) -> Self {
        Self {
            pool,
            emails,
            http: reqwest::Client::new(),
        }
    }

    /// Entry point for inbound events: run every matching active trigger.
    pub async fn handle_event(&self, event_type: &str, payload: Value) -> AppResult<EventOutcome> {
        let triggers =
            AutomationTriggerRepository::find_active_by_type(&self.pool, event_type).await?;

        tracing::debug!(
            event_type = %event_type,
            candidates = triggers.len(),
            "Evaluating automation triggers"
        );

        let mut outcome = EventOutcome::default();

        for trigger in triggers {
            let condition = match Condition::parse_stored(trigger.conditions.as_deref()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(trigger = %trigger.id, "Unparseable trigger conditions: {:?}", e);
                    continue;
                }
            };

            if let Some(condition) = &condition {
                if !condition.evaluate(&payload) {
                    tracing::debug!(trigger = %trigger.id, "Trigger conditions did not match");
                    continue;
                }
            }

            outcome.triggers_matched += 1;

            let workflows =
                AutomationWorkflowRepository::find_active_by_trigger(&self.pool, &trigger.id)
                    .await?;

            for workflow in workflows {
                match self.start_workflow(&workflow, payload.clone()).await {
                    Ok(true) => outcome.workflows_run += 1,
                    Ok(false) => {}
                    // One workflow failing must not stop its siblings.
                    Err(e) => {
                        tracing::warn!(
                            workflow = %workflow.id,
                            trigger = %trigger.id,
                            "Workflow execution failed: {:?}",
                            e
                        );
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Begin one workflow execution. Returns `Ok(false)` when workflow-level
    /// conditions rejected the payload.
    async fn start_workflow(
        &self,
        workflow: &AutomationWorkflow,
        payload: Value,
    ) -> AppResult<bool> {
        if let Some(condition) = Condition::parse_stored(workflow.conditions.as_deref())? {
            if !condition.evaluate(&payload) {
                tracing::debug!(workflow = %workflow.id, "Workflow conditions did not match");
                return Ok(false);
            }
        }

        let steps = AutomationStepRepository::list_by_workflow(&self.pool, &workflow.id).await?;

        // A workflow-level delay parks the whole execution before step one.
        if workflow.delay_minutes > 0 {
            let first_order = steps.first().map(|s| s.step_order).unwrap_or(0);
            self.park(workflow, first_order, &payload, workflow.delay_minutes)
                .await?;
            return Ok(true);
        }

        self.run_steps(workflow, &steps, payload).await?;
        Ok(true)
    }

    /// Execute steps strictly in ascending order. Returns the payload as it
    /// stood after the last executed step.
    ///
    /// A `wait` step with a positive delay persists a resumption row and
    /// returns early; the resumption poller re-enters the remaining steps
    /// later. Unknown step types are logged and skipped.
    pub async fn run_steps(
        &self,
        workflow: &AutomationWorkflow,
        steps: &[AutomationStep],
        mut payload: Value,
    ) -> AppResult<Value> {
        for (idx, step) in steps.iter().enumerate() {
            let config: Value = match step.config.as_deref() {
                Some(raw) => serde_json::from_str(raw).map_err(|e| {
                    AppError::BadRequest(format!("Step {} has invalid config: {}", step.id, e))
                })?,
                None => Value::Null,
            };

            match step.step_type.as_str() {
                "send_email" => {
                    self.step_send_email(workflow, &config, &payload).await?;
                }
                "wait" => {
                    let minutes = config
                        .get("delay_minutes")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    if minutes > 0 {
                        if let Some(next) = steps.get(idx + 1) {
                            self.park(workflow, next.step_order, &payload, minutes).await?;
                        }
                        return Ok(payload);
                    }
                    // Zero-delay waits fall straight through to the next step.
                }
                "condition" => {
                    let conditions = config.get("conditions").unwrap_or(&Value::Null);
                    let matched = match Condition::from_json(conditions)? {
                        Some(condition) => condition.evaluate(&payload),
                        None => true,
                    };
                    // Downstream steps read the outcome out of the payload.
                    payload["condition_result"] = Value::Bool(matched);
                }
                "webhook" => {
                    self.step_webhook(&config, &payload).await?;
                }
                other => {
                    tracing::warn!(
                        step = %step.id,
                        workflow = %workflow.id,
                        "Skipping unknown automation step type '{}'",
                        other
                    );
                }
            }
        }

        Ok(payload)
    }

    async fn park(
        &self,
        workflow: &AutomationWorkflow,
        next_step_order: i64,
        payload: &Value,
        minutes: i64,
    ) -> AppResult<()> {
        let resume_at = Utc::now().naive_utc() + chrono::Duration::minutes(minutes);

        WorkflowResumptionRepository::create(
            &self.pool,
            CreateWorkflowResumption {
                workflow_id: workflow.id.clone(),
                next_step_order,
                payload: payload.to_string(),
                resume_at,
            },
        )
        .await?;

        tracing::info!(
            workflow = %workflow.id,
            resume_at = %resume_at,
            next_step_order,
            "Workflow parked until its wait elapses"
        );
        Ok(())
    }

    /// Re-enter a parked workflow at its recorded step.
    pub async fn resume(&self, resumption: WorkflowResumption) -> AppResult<()> {
        let workflow =
            AutomationWorkflowRepository::find_by_id(&self.pool, &resumption.workflow_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "Workflow {} for resumption {} no longer exists",
                        resumption.workflow_id, resumption.id
                    ))
                })?;

        let steps = AutomationStepRepository::list_from(
            &self.pool,
            &workflow.id,
            resumption.next_step_order,
        )
        .await?;

        let payload: Value = serde_json::from_str(&resumption.payload).map_err(|e| {
            AppError::Internal(anyhow::anyhow!(
                "Resumption {} carries unreadable payload: {}",
                resumption.id,
                e
            ))
        })?;

        self.run_steps(&workflow, &steps, payload).await?;
        Ok(())
    }

    async fn step_send_email(
        &self,
        workflow: &AutomationWorkflow,
        config: &Value,
        payload: &Value,
    ) -> AppResult<()> {
        let to = config
            .get("to")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                let field = config
                    .get("to_field")
                    .and_then(Value::as_str)
                    .unwrap_or("email");
                payload.get(field).and_then(Value::as_str).map(str::to_string)
            })
            .ok_or_else(|| {
                AppError::BadRequest("send_email step resolved no recipient".to_string())
            })?;

        let template = config
            .get("template")
            .and_then(Value::as_str)
            .or(workflow.template_key.as_deref())
            .unwrap_or("custom")
            .to_string();

        let subject = config
            .get("subject")
            .and_then(Value::as_str)
            .map(str::to_string);

        self.emails
            .enqueue(SendEmailRequest {
                to,
                template,
                data: Some(payload.clone()),
                subject,
                attachments: None,
                campaign_id: None,
                created_by: Some(format!("automation:{}", workflow.id)),
            })
            .await?;

        Ok(())
    }

    async fn step_webhook(&self, config: &Value, payload: &Value) -> AppResult<()> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::BadRequest("webhook step has no url".to_string()))?;

        let response = self.http.post(url).json(payload).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmailQueueConfig;
    use crate::db::{
        CreateAutomationStep, CreateAutomationTrigger, CreateAutomationWorkflow,
        DeliveryRecordRepository,
    };
    use crate::services::mailer::{Outgoing, Transport};

    use async_trait::async_trait;
    use serde_json::json;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _outgoing: &Outgoing) -> AppResult<String> {
            Ok("<null@test>".to_string())
        }
    }

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn engine(pool: &SqlitePool) -> AutomationEngine {
        let emails = EmailService::from_parts(
            pool.clone(),
            EmailQueueConfig {
                enabled: true,
                poll_interval_seconds: 1,
                max_attempts: 3,
                rate_limit_per_second: 100,
                batch_size: 10,
            },
            "http://localhost:8080".to_string(),
            Arc::new(NullTransport),
        );
        AutomationEngine::from_parts(pool.clone(), emails)
    }

    async fn seed_trigger(
        pool: &SqlitePool,
        trigger_type: &str,
        conditions: Option<&str>,
    ) -> String {
        AutomationTriggerRepository::create(
            pool,
            CreateAutomationTrigger {
                name: format!("{} trigger", trigger_type),
                trigger_type: trigger_type.to_string(),
                conditions: conditions.map(str::to_string),
                is_active: Some(true),
            },
        )
        .await
        .unwrap()
        .id
    }

    async fn seed_workflow(pool: &SqlitePool, trigger_id: &str) -> String {
        AutomationWorkflowRepository::create(
            pool,
            CreateAutomationWorkflow {
                trigger_id: trigger_id.to_string(),
                name: "follow-up".to_string(),
                template_key: Some("booking-confirmation".to_string()),
                delay_minutes: Some(0),
                conditions: None,
                is_active: Some(true),
            },
        )
        .await
        .unwrap()
        .id
    }

    async fn seed_step(pool: &SqlitePool, workflow_id: &str, order: i64, kind: &str, config: Value) {
        AutomationStepRepository::create(
            pool,
            CreateAutomationStep {
                workflow_id: workflow_id.to_string(),
                step_order: order,
                step_type: kind.to_string(),
                config: Some(config.to_string()),
            },
        )
        .await
        .unwrap();
    }

    #[test]
    fn flat_equality_conditions_match_spec_semantics() {
        let condition = Condition::from_json(&json!({ "status": "confirmed" }))
            .unwrap()
            .unwrap();

        assert!(condition.evaluate(&json!({ "status": "confirmed", "other": 1 })));
        assert!(!condition.evaluate(&json!({ "status": "pending" })));
        assert!(!condition.evaluate(&json!({})));
    }

    #[test]
    fn tagged_conditions_compose() {
        let condition = Condition::from_json(&json!({
            "op": "any",
            "conditions": [
                { "op": "equals", "field": "status", "value": "confirmed" },
                { "op": "range", "field": "amount", "min": 100.0 }
            ]
        }))
        .unwrap()
        .unwrap();

        assert!(condition.evaluate(&json!({ "status": "confirmed" })));
        assert!(condition.evaluate(&json!({ "status": "pending", "amount": 250 })));
        assert!(!condition.evaluate(&json!({ "status": "pending", "amount": 50 })));
    }

    #[test]
    fn one_of_checks_membership() {
        let condition = Condition::from_json(&json!({
            "op": "one_of",
            "field": "tour",
            "values": ["safari", "trek"]
        }))
        .unwrap()
        .unwrap();

        assert!(condition.evaluate(&json!({ "tour": "safari" })));
        assert!(!condition.evaluate(&json!({ "tour": "cruise" })));
    }

    #[test]
    fn empty_or_missing_conditions_always_match() {
        assert!(Condition::from_json(&json!({})).unwrap().is_none());
        assert!(Condition::from_json(&Value::Null).unwrap().is_none());
        assert!(Condition::parse_stored(None).unwrap().is_none());
        assert!(Condition::parse_stored(Some("")).unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_delay_wait_runs_both_sends_in_order() {
        let pool = test_pool().await;
        let engine = engine(&pool);

        let trigger_id = seed_trigger(&pool, "booking.confirmed", None).await;
        let workflow_id = seed_workflow(&pool, &trigger_id).await;
        seed_step(&pool, &workflow_id, 1, "send_email", json!({ "to": "a@example.com" })).await;
        seed_step(&pool, &workflow_id, 2, "wait", json!({ "delay_minutes": 0 })).await;
        seed_step(&pool, &workflow_id, 3, "send_email", json!({ "to": "b@example.com" })).await;

        let outcome = engine
            .handle_event("booking.confirmed", json!({ "bookingId": "BK1" }))
            .await
            .unwrap();
        assert_eq!(outcome.triggers_matched, 1);
        assert_eq!(outcome.workflows_run, 1);

        let records = DeliveryRecordRepository::list_with_filters(
            &pool, 10, 0, None, None, None, None,
        )
        .await
        .unwrap();
        assert_eq!(records.len(), 2);

        // list is newest-first
        let mut recipients: Vec<_> =
            records.iter().map(|r| r.recipient_email.clone()).collect();
        recipients.reverse();
        assert_eq!(recipients, vec!["a@example.com", "b@example.com"]);
    }

    #[tokio::test]
    async fn positive_wait_parks_and_resume_finishes_the_workflow() {
        let pool = test_pool().await;
        let engine = engine(&pool);

        let trigger_id = seed_trigger(&pool, "booking.confirmed", None).await;
        let workflow_id = seed_workflow(&pool, &trigger_id).await;
        seed_step(&pool, &workflow_id, 1, "send_email", json!({ "to": "a@example.com" })).await;
        seed_step(&pool, &workflow_id, 2, "wait", json!({ "delay_minutes": 30 })).await;
        seed_step(&pool, &workflow_id, 3, "send_email", json!({ "to": "b@example.com" })).await;

        engine
            .handle_event("booking.confirmed", json!({ "bookingId": "BK1" }))
            .await
            .unwrap();

        // Only the first send ran; the rest is parked.
        let records =
            DeliveryRecordRepository::list_with_filters(&pool, 10, 0, None, None, None, None)
                .await
                .unwrap();
        assert_eq!(records.len(), 1);

        let past = Utc::now().naive_utc() - chrono::Duration::seconds(5);
        sqlx::query("UPDATE workflow_resumptions SET resume_at = ?")
            .bind(past)
            .execute(&pool)
            .await
            .unwrap();

        let due = WorkflowResumptionRepository::fetch_and_claim_due(&pool, 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].next_step_order, 3);

        engine.resume(due.into_iter().next().unwrap()).await.unwrap();

        let records =
            DeliveryRecordRepository::list_with_filters(&pool, 10, 0, None, None, None, None)
                .await
                .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn condition_step_stores_result_in_payload() {
        let pool = test_pool().await;
        let engine = engine(&pool);

        let trigger_id = seed_trigger(&pool, "booking.confirmed", None).await;
        let workflow_id = seed_workflow(&pool, &trigger_id).await;
        seed_step(
            &pool,
            &workflow_id,
            1,
            "condition",
            json!({ "conditions": { "status": "confirmed" } }),
        )
        .await;

        let workflow = AutomationWorkflowRepository::find_by_id(&pool, &workflow_id)
            .await
            .unwrap()
            .unwrap();
        let steps = AutomationStepRepository::list_by_workflow(&pool, &workflow_id)
            .await
            .unwrap();

        let payload = engine
            .run_steps(&workflow, &steps, json!({ "status": "confirmed" }))
            .await
            .unwrap();
        assert_eq!(payload["condition_result"], json!(true));

        let payload = engine
            .run_steps(&workflow, &steps, json!({ "status": "pending" }))
            .await
            .unwrap();
        assert_eq!(payload["condition_result"], json!(false));
    }

    #[tokio::test]
    async fn unknown_step_types_are_skipped_not_fatal() {
        let pool = test_pool().await;
        let engine = engine(&pool);

        let trigger_id = seed_trigger(&pool, "booking.confirmed", None).await;
        let workflow_id = seed_workflow(&pool, &trigger_id).await;
        seed_step(&pool, &workflow_id, 1, "carrier_pigeon", json!({})).await;
        seed_step(&pool, &workflow_id, 2, "send_email", json!({ "to": "a@example.com" })).await;

        let outcome = engine
            .handle_event("booking.confirmed", json!({}))
            .await
            .unwrap();
        assert_eq!(outcome.workflows_run, 1);

        let records =
            DeliveryRecordRepository::list_with_filters(&pool, 10, 0, None, None, None, None)
                .await
                .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn failing_step_aborts_its_workflow_but_not_siblings() {
        let pool = test_pool().await;
        let engine = engine(&pool);

        let trigger_id = seed_trigger(&pool, "booking.confirmed", None).await;

        // First workflow fails at step 1 (no recipient anywhere), so its
        // second step must not run.
        let broken = seed_workflow(&pool, &trigger_id).await;
        seed_step(&pool, &broken, 1, "send_email", json!({})).await;
        seed_step(&pool, &broken, 2, "send_email", json!({ "to": "never@example.com" })).await;

        let healthy = seed_workflow(&pool, &trigger_id).await;
        seed_step(&pool, &healthy, 1, "send_email", json!({ "to": "ok@example.com" })).await;

        let outcome = engine
            .handle_event("booking.confirmed", json!({}))
            .await
            .unwrap();
        assert_eq!(outcome.workflows_run, 1);

        let records =
            DeliveryRecordRepository::list_with_filters(&pool, 10, 0, None, None, None, None)
                .await
                .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].recipient_email, "ok@example.com");
    }

    #[tokio::test]
    async fn trigger_conditions_gate_execution() {
        let pool = test_pool().await;
        let engine = engine(&pool);

        let trigger_id =
            seed_trigger(&pool, "booking.updated", Some(r#"{"status":"confirmed"}"#)).await;
        let workflow_id = seed_workflow(&pool, &trigger_id).await;
        seed_step(&pool, &workflow_id, 1, "send_email", json!({ "to": "a@example.com" })).await;

        let outcome = engine
            .handle_event("booking.updated", json!({ "status": "pending" }))
            .await
            .unwrap();
        assert_eq!(outcome.triggers_matched, 0);

        let outcome = engine
            .handle_event("booking.updated", json!({ "status": "confirmed", "other": 1 }))
            .await
            .unwrap();
        assert_eq!(outcome.triggers_matched, 1);
        assert_eq!(outcome.workflows_run, 1);
    }
}
