use std::sync::Arc;

use chrono::Utc;
use lettre::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::config::EmailQueueConfig;
use crate::db::{
    CreateDeliveryRecord, CreateSendTask, DeliveryRecord, DeliveryRecordRepository, ScheduledEmail,
    ScheduledEmailRepository, SendQueueRepository, SendTask,
};
use crate::error::AppResult;
use crate::services::mailer::{Attachment, Mailer, Outgoing, Transport};
use crate::services::templates::TemplateService;
use crate::AppState;

pub const MAX_RETRY_ERROR: &str = "Max retry attempts exceeded";

/// A send request as accepted by the public API and by internal callers
/// (campaigns, scheduled emails, automation steps). Every send in the system
/// goes through `EmailService::enqueue`; nothing sends directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmailRequest {
    pub to: String,
    pub template: String,
    pub data: Option<Value>,
    pub subject: Option<String>,
    pub attachments: Option<Vec<Attachment>>,
    #[serde(skip)]
    pub campaign_id: Option<String>,
    #[serde(skip)]
    pub created_by: Option<String>,
}

/// Accepts send requests into the durable queue and processes claimed tasks
/// on behalf of the background worker.
pub struct EmailService {
    pool: SqlitePool,
    config: EmailQueueConfig,
    /// Base URL for the open-tracking pixel injected into outgoing HTML.
    public_url: String,
    transport: Arc<dyn Transport>,
    /// Concrete mailer handle, present outside tests, used to recreate the
    /// SMTP connection pool after a failed send.
    mailer: Option<Arc<Mailer>>,
}

impl EmailService {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            pool: state.db.clone(),
            config: state.config.queue.clone(),
            public_url: state.config.server.public_url.clone(),
            transport: state.mailer.clone(),
            mailer: Some(state.mailer.clone()),
        }
    }

    /// Assemble a service from its parts, bypassing `AppState`, so tests can
    /// substitute the transport.
    #[cfg(test)]
    pub(crate) fn from_parts(
        pool: SqlitePool,
        config: EmailQueueConfig,
        public_url: String,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            pool,
            config,
            public_url,
            transport,
            mailer: None,
        }
    }

    /// Append the open-tracking pixel for `record_id` to an HTML body.
    fn inject_tracking_pixel(&self, html: &str, record_id: &str) -> String {
        let pixel = format!(
            r#"<img src="{}/track/open/{}" width="1" height="1" alt="" style="display:none;">"#,
            self.public_url.trim_end_matches('/'),
            record_id
        );
        match html.rfind("</body>") {
            Some(pos) => format!("{}{}\n{}", &html[..pos], pixel, &html[pos..]),
            None => format!("{}\n{}", html, pixel),
        }
    }

    /// Delay before the retry following failure number `attempts` (counted
    /// from zero): 1s, 2s, 4s, ...
    pub fn backoff_delay(attempts: u32) -> chrono::Duration {
        chrono::Duration::seconds(2i64.saturating_pow(attempts))
    }

    /// Validate, render and persist a send: one `pending` delivery record
    /// plus one queue task. Returns the record synchronously; actual delivery
    /// happens when the worker claims the task.
    pub async fn enqueue(&self, request: SendEmailRequest) -> AppResult<DeliveryRecord> {
        request.to.parse::<Address>()?;

        let data = request.data.unwrap_or_else(|| Value::Object(Default::default()));
        let (key, rendered) = TemplateService::render_for_slug(
            &self.pool,
            &request.template,
            &data,
            request.subject.as_deref(),
        )
        .await?;

        let record = DeliveryRecordRepository::create(
            &self.pool,
            CreateDeliveryRecord {
                recipient_email: request.to.clone(),
                template_key: key.as_str().to_string(),
                subject: rendered.subject.clone(),
                html_content: rendered.html.clone(),
                custom_data: serde_json::to_string(&data).ok(),
                campaign_id: request.campaign_id,
                created_by: request.created_by,
            },
        )
        .await?;

        let attachments_json = match &request.attachments {
            Some(attachments) if !attachments.is_empty() => {
                Some(serde_json::to_string(attachments).map_err(|e| {
                    crate::error::AppError::Validation(format!("Unserializable attachments: {}", e))
                })?)
            }
            _ => None,
        };

        SendQueueRepository::create(
            &self.pool,
            CreateSendTask {
                delivery_record_id: record.id.clone(),
                recipient_email: request.to.clone(),
                template_key: key.as_str().to_string(),
                subject: rendered.subject,
                html_content: self.inject_tracking_pixel(&rendered.html, &record.id),
                attachments_json,
                max_attempts: Some(self.config.max_attempts as i32),
                next_attempt_at: None,
            },
        )
        .await?;

        tracing::info!(
            record = %record.id,
            to = %request.to,
            template = %key.as_str(),
            "Email enqueued"
        );

        Ok(record)
    }

    /// Promote a due scheduled email into a real queued send, marking the
    /// scheduled row `sent` or `failed` accordingly. An enqueue failure is
    /// recorded on the row and swallowed so the sweeper keeps going.
    pub async fn promote_scheduled(&self, scheduled: ScheduledEmail) -> AppResult<()> {
        let data = scheduled
            .template_data
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());

        let request = SendEmailRequest {
            to: scheduled.recipient_email.clone(),
            template: scheduled.template_slug.clone(),
            data,
            subject: scheduled.subject.clone(),
            attachments: None,
            campaign_id: None,
            created_by: Some("scheduler".to_string()),
        };

        match self.enqueue(request).await {
            Ok(record) => {
                ScheduledEmailRepository::mark_sent(&self.pool, &scheduled.id).await?;
                tracing::info!(
                    scheduled = %scheduled.id,
                    record = %record.id,
                    "Scheduled email promoted into the send queue"
                );
            }
            Err(e) => {
                let err_str = e.to_string();
                tracing::warn!(
                    scheduled = %scheduled.id,
                    "Failed to promote scheduled email: {}",
                    err_str
                );
                if let Err(mark_err) =
                    ScheduledEmailRepository::mark_failed(&self.pool, &scheduled.id, &err_str).await
                {
                    tracing::warn!(
                        scheduled = %scheduled.id,
                        "Failed to record scheduled email failure: {:?}",
                        mark_err
                    );
                }
            }
        }

        Ok(())
    }

    /// Attempt delivery of one claimed task. Returns `Ok(true)` when the
    /// message was handed to the relay (the caller rate-limit-sleeps on
    /// success), `Ok(false)` otherwise.
    ///
    /// On failure the task is rescheduled with exponential backoff until its
    /// attempts are exhausted, at which point the task goes dead and the
    /// delivery record is permanently failed. Persistence errors while
    /// recording a failed send are logged and swallowed so they never mask
    /// the send failure itself.
    pub async fn process_task(&self, task: SendTask) -> AppResult<bool> {
        let attachments: Vec<Attachment> = match &task.attachments_json {
            Some(json) => serde_json::from_str(json).unwrap_or_else(|e| {
                tracing::warn!(task = %task.id, "Dropping unreadable attachments: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        let outgoing = Outgoing {
            to: task.recipient_email.clone(),
            subject: task.subject.clone(),
            html: task.html_content.clone(),
            attachments,
        };

        match self.transport.send(&outgoing).await {
            Ok(message_id) => {
                if let Err(e) = SendQueueRepository::mark_succeeded(&self.pool, &task.id).await {
                    tracing::warn!(task = %task.id, "Failed to mark queue task succeeded: {:?}", e);
                }
                match DeliveryRecordRepository::mark_sent(
                    &self.pool,
                    &task.delivery_record_id,
                    &message_id,
                )
                .await
                {
                    Ok(_) => tracing::info!(
                        task = %task.id,
                        record = %task.delivery_record_id,
                        "Email sent"
                    ),
                    Err(e) => tracing::warn!(
                        record = %task.delivery_record_id,
                        "Failed to mark delivery record sent: {:?}",
                        e
                    ),
                }
                Ok(true)
            }
            Err(e) => {
                let err_str = e.to_string();
                tracing::warn!(task = %task.id, attempts = task.attempts, "Send failed: {}", err_str);

                // The pooled connection may be wedged; recreate it before the
                // next attempt, inline, as the only recovery mechanism.
                if let Some(mailer) = &self.mailer {
                    if let Err(rebuild_err) = mailer.rebuild().await {
                        tracing::warn!("Failed to recreate SMTP transport: {:?}", rebuild_err);
                    }
                }

                let next =
                    Utc::now().naive_utc() + Self::backoff_delay(task.attempts.max(0) as u32);

                match SendQueueRepository::register_attempt_and_schedule(
                    &self.pool,
                    &task.id,
                    next,
                    Some(err_str.clone()),
                )
                .await
                {
                    Ok(updated) if updated.status == "dead" => {
                        tracing::warn!(
                            task = %task.id,
                            "Email task exhausted its {} attempts",
                            updated.max_attempts
                        );
                        if let Err(e) = DeliveryRecordRepository::mark_failed(
                            &self.pool,
                            &task.delivery_record_id,
                            MAX_RETRY_ERROR,
                        )
                        .await
                        {
                            tracing::warn!(
                                record = %task.delivery_record_id,
                                "Failed to mark delivery record failed: {:?}",
                                e
                            );
                        }
                    }
                    Ok(updated) => {
                        tracing::info!(
                            task = %task.id,
                            attempts = updated.attempts,
                            next_attempt_at = %updated.next_attempt_at,
                            "Email task rescheduled"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(task = %task.id, "Failed to reschedule email task: {:?}", e);
                    }
                }

                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DeliveryStatus;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    struct MockTransport {
        /// Outcomes popped per send; empty means succeed.
        failures: Mutex<Vec<String>>,
        sent: Mutex<Vec<Outgoing>>,
    }

    impl MockTransport {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn failing(times: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(vec!["connection reset".to_string(); times]),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_recipients(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|o| o.to.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, outgoing: &Outgoing) -> AppResult<String> {
            if let Some(error) = self.failures.lock().unwrap().pop() {
                return Err(crate::error::AppError::ServiceUnavailable(error));
            }
            self.sent.lock().unwrap().push(outgoing.clone());
            Ok(format!("<{}@test>", uuid::Uuid::new_v4()))
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

    fn service(pool: &SqlitePool, transport: Arc<MockTransport>) -> EmailService {
        EmailService::from_parts(
            pool.clone(),
            EmailQueueConfig {
                enabled: true,
                poll_interval_seconds: 1,
                max_attempts: 3,
                rate_limit_per_second: 100,
                batch_size: 10,
            },
            "http://localhost:8080".to_string(),
            transport,
        )
    }

    fn booking_request(to: &str) -> SendEmailRequest {
        SendEmailRequest {
            to: to.to_string(),
            template: "booking-confirmation".to_string(),
            data: Some(json!({
                "bookingId": "BK100",
                "customerName": "Jane",
                "tourName": "Safari",
                "startDate": "2025-01-01",
                "endDate": "2025-01-05",
                "totalAmount": 500,
                "participants": 2
            })),
            subject: None,
            attachments: None,
            campaign_id: None,
            created_by: None,
        }
    }

    async fn backdate_queue(pool: &SqlitePool) {
        let past = Utc::now().naive_utc() - chrono::Duration::seconds(60);
        sqlx::query("UPDATE email_queue SET next_attempt_at = ? WHERE status = 'pending'")
            .bind(past)
            .execute(pool)
            .await
            .unwrap();
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(EmailService::backoff_delay(0).num_seconds(), 1);
        assert_eq!(EmailService::backoff_delay(1).num_seconds(), 2);
        assert_eq!(EmailService::backoff_delay(2).num_seconds(), 4);
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_recipient() {
        let pool = test_pool().await;
        let svc = service(&pool, MockTransport::succeeding());

        assert!(matches!(
            svc.enqueue(booking_request("not-an-address")).await,
            Err(crate::error::AppError::Address(_))
        ));
    }

    #[tokio::test]
    async fn enqueue_then_process_transitions_record_to_sent() {
        let pool = test_pool().await;
        let transport = MockTransport::succeeding();
        let svc = service(&pool, transport.clone());

        let record = svc.enqueue(booking_request("test@example.com")).await.unwrap();
        assert_eq!(record.status, "pending");
        assert!(record.html_content.contains("BK100"));
        assert!(record.html_content.contains("Jane"));

        backdate_queue(&pool).await;
        let tasks = SendQueueRepository::fetch_and_claim_due(&pool, 10).await.unwrap();
        assert_eq!(tasks.len(), 1);

        let sent = svc.process_task(tasks.into_iter().next().unwrap()).await.unwrap();
        assert!(sent);

        let record = DeliveryRecordRepository::find_by_id(&pool, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, "sent");
        assert!(record.message_id.is_some());
        assert!(record.sent_at.is_some());
    }

    #[tokio::test]
    async fn drain_preserves_fifo_order() {
        let pool = test_pool().await;
        let transport = MockTransport::succeeding();
        let svc = service(&pool, transport.clone());

        for to in ["a@example.com", "b@example.com", "c@example.com"] {
            svc.enqueue(booking_request(to)).await.unwrap();
        }

        backdate_queue(&pool).await;
        let tasks = SendQueueRepository::fetch_and_claim_due(&pool, 10).await.unwrap();
        assert_eq!(tasks.len(), 3);

        for task in tasks {
            svc.process_task(task).await.unwrap();
        }

        assert_eq!(
            transport.sent_recipients(),
            vec!["a@example.com", "b@example.com", "c@example.com"]
        );
    }

    #[tokio::test]
    async fn failed_sends_retry_then_exhaust_with_max_retry_error() {
        let pool = test_pool().await;
        let transport = MockTransport::failing(10);
        let svc = service(&pool, transport.clone());

        let record = svc.enqueue(booking_request("test@example.com")).await.unwrap();

        for round in 0..3 {
            backdate_queue(&pool).await;
            let tasks = SendQueueRepository::fetch_and_claim_due(&pool, 10).await.unwrap();
            assert_eq!(tasks.len(), 1, "round {}", round);
            let task = tasks.into_iter().next().unwrap();
            assert_eq!(task.attempts, round);
            let sent = svc.process_task(task).await.unwrap();
            assert!(!sent);
        }

        // Attempts exhausted: nothing left to claim, record permanently failed.
        backdate_queue(&pool).await;
        let tasks = SendQueueRepository::fetch_and_claim_due(&pool, 10).await.unwrap();
        assert!(tasks.is_empty());

        let record = DeliveryRecordRepository::find_by_id(&pool, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, "failed");
        assert_eq!(record.error_message.as_deref(), Some(MAX_RETRY_ERROR));
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let pool = test_pool().await;
        let transport = MockTransport::failing(1);
        let svc = service(&pool, transport.clone());

        let record = svc.enqueue(booking_request("test@example.com")).await.unwrap();

        backdate_queue(&pool).await;
        let task = SendQueueRepository::fetch_and_claim_due(&pool, 1)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        assert!(!svc.process_task(task).await.unwrap());

        backdate_queue(&pool).await;
        let task = SendQueueRepository::fetch_and_claim_due(&pool, 1)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(task.attempts, 1);
        assert!(svc.process_task(task).await.unwrap());

        let record = DeliveryRecordRepository::find_by_id(&pool, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, "sent");
    }

    #[tokio::test]
    async fn due_scheduled_email_is_promoted_and_marked_sent() {
        use crate::db::CreateScheduledEmail;

        let pool = test_pool().await;
        let svc = service(&pool, MockTransport::succeeding());

        let scheduled = ScheduledEmailRepository::create(
            &pool,
            CreateScheduledEmail {
                recipient_email: "test@example.com".to_string(),
                template_slug: "booking-confirmation".to_string(),
                template_data: Some(r#"{"bookingId":"BK7","customerName":"Jane"}"#.to_string()),
                subject: None,
                scheduled_at: Utc::now().naive_utc() - chrono::Duration::minutes(5),
            },
        )
        .await
        .unwrap();

        let due = ScheduledEmailRepository::fetch_due(&pool, 10).await.unwrap();
        assert_eq!(due.len(), 1);

        svc.promote_scheduled(due.into_iter().next().unwrap())
            .await
            .unwrap();

        let rows = ScheduledEmailRepository::list(&pool, 10, 0).await.unwrap();
        assert_eq!(rows[0].id, scheduled.id);
        assert_eq!(rows[0].status, "sent");
        assert!(rows[0].sent_at.is_some());

        // And it landed in the real queue.
        backdate_queue(&pool).await;
        let tasks = SendQueueRepository::fetch_and_claim_due(&pool, 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].html_content.contains("BK7"));
    }

    #[tokio::test]
    async fn sent_record_never_regresses_to_pending() {
        let pool = test_pool().await;
        let transport = MockTransport::succeeding();
        let svc = service(&pool, transport.clone());

        let record = svc.enqueue(booking_request("test@example.com")).await.unwrap();
        backdate_queue(&pool).await;
        let task = SendQueueRepository::fetch_and_claim_due(&pool, 1)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        svc.process_task(task).await.unwrap();

        // Tracking can deepen engagement but nothing can rewind the status.
        DeliveryRecordRepository::advance_status(&pool, &record.id, DeliveryStatus::Opened, None)
            .await
            .unwrap();
        let err = DeliveryRecordRepository::advance_status(
            &pool,
            &record.id,
            DeliveryStatus::Pending,
            None,
        )
        .await;
        assert!(matches!(err, Err(crate::error::AppError::Conflict(_))));
    }
}
