use std::sync::Arc;

use serde_json::Value;
use sqlx::SqlitePool;

use crate::db::{Campaign, CampaignRepository, CampaignStatus};
use crate::error::AppResult;
use crate::services::emails::{EmailService, SendEmailRequest};
use crate::AppState;

/// Fans a campaign out to an explicit recipient list through the unified
/// enqueue path, walking the campaign status forward as it goes.
pub struct CampaignService {
    pool: SqlitePool,
    emails: EmailService,
}

impl CampaignService {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            pool: state.db.clone(),
            emails: EmailService::new(state),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(pool: SqlitePool, emails: EmailService) -> Self {
        Self { pool, emails }
    }

    /// Send `campaign` to every address in `recipients`.
    ///
    /// Transitions `draft → sending` up front (re-sending a campaign is a
    /// conflict), enqueues one delivery per recipient, then records the
    /// recipient count and finishes with `sending → sent`. Individual bad
    /// addresses are logged and skipped rather than aborting the fan-out.
    pub async fn send(&self, campaign_id: &str, recipients: &[String]) -> AppResult<Campaign> {
        let campaign =
            CampaignRepository::transition_status(&self.pool, campaign_id, CampaignStatus::Sending)
                .await?;

        let data: Value = campaign
            .custom_data
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| Value::Object(Default::default()));

        let mut enqueued: i64 = 0;
        for recipient in recipients {
            let request = SendEmailRequest {
                to: recipient.clone(),
                template: campaign.template_key.clone(),
                data: Some(data.clone()),
                subject: campaign.subject.clone(),
                attachments: None,
                campaign_id: Some(campaign.id.clone()),
                created_by: None,
            };

            match self.emails.enqueue(request).await {
                Ok(_) => enqueued += 1,
                Err(e) => {
                    tracing::warn!(
                        campaign = %campaign.id,
                        recipient = %recipient,
                        "Skipping campaign recipient: {:?}",
                        e
                    );
                }
            }
        }

        CampaignRepository::set_total_recipients(&self.pool, &campaign.id, enqueued).await?;
        let campaign =
            CampaignRepository::transition_status(&self.pool, &campaign.id, CampaignStatus::Sent)
                .await?;

        tracing::info!(
            campaign = %campaign.id,
            recipients = enqueued,
            "Campaign fan-out complete"
        );

        Ok(campaign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmailQueueConfig;
    use crate::db::{CreateCampaign, DeliveryRecordRepository};
    use crate::error::{AppError, AppResult};
    use crate::services::mailer::{Outgoing, Transport};

    use async_trait::async_trait;

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

    fn service(pool: &SqlitePool) -> CampaignService {
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
        CampaignService::from_parts(pool.clone(), emails)
    }

    async fn seed_campaign(pool: &SqlitePool) -> Campaign {
        CampaignRepository::create(
            pool,
            CreateCampaign {
                name: "Spring safari promo".to_string(),
                template_key: "custom".to_string(),
                subject: Some("Spring departures now open".to_string()),
                custom_data: Some(r#"{"message":"New safari dates are live."}"#.to_string()),
                scheduled_at: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn send_links_records_and_finishes_sent() {
        let pool = test_pool().await;
        let svc = service(&pool);
        let campaign = seed_campaign(&pool).await;

        let recipients = vec![
            "a@example.com".to_string(),
            "b@example.com".to_string(),
            "not-an-address".to_string(),
        ];

        let campaign = svc.send(&campaign.id, &recipients).await.unwrap();
        assert_eq!(campaign.status, "sent");
        assert_eq!(campaign.total_recipients, 2);

        let linked = DeliveryRecordRepository::list_with_filters(
            &pool,
            10,
            0,
            None,
            None,
            None,
            Some(&campaign.id),
        )
        .await
        .unwrap();
        assert_eq!(linked.len(), 2);
        for record in linked {
            assert_eq!(record.status, "pending");
            assert!(record.html_content.contains("New safari dates are live."));
        }
    }

    #[tokio::test]
    async fn resending_a_sent_campaign_conflicts() {
        let pool = test_pool().await;
        let svc = service(&pool);
        let campaign = seed_campaign(&pool).await;

        svc.send(&campaign.id, &["a@example.com".to_string()])
            .await
            .unwrap();

        let err = svc.send(&campaign.id, &["a@example.com".to_string()]).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));
    }
}
