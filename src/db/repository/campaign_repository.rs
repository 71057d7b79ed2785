use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Campaign, CampaignStatus, CreateCampaign};
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id,
    name,
    template_key,
    subject,
    custom_data,
    scheduled_at,
    status,
    total_recipients,
    created_at,
    updated_at
"#;

pub struct CampaignRepository;

impl CampaignRepository {
    pub async fn create(pool: &SqlitePool, campaign: CreateCampaign) -> AppResult<Campaign> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, Campaign>(&format!(
            r#"
            INSERT INTO campaigns (
                id, name, template_key, subject, custom_data,
                scheduled_at, status, total_recipients, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'draft', 0, ?, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(campaign.name)
        .bind(campaign.template_key)
        .bind(campaign.subject)
        .bind(campaign.custom_data)
        .bind(campaign.scheduled_at)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Campaign>> {
        let row = sqlx::query_as::<_, Campaign>(&format!(
            "SELECT {COLUMNS} FROM campaigns WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list(pool: &SqlitePool) -> AppResult<Vec<Campaign>> {
        let rows = sqlx::query_as::<_, Campaign>(&format!(
            "SELECT {COLUMNS} FROM campaigns ORDER BY created_at DESC"
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Move a campaign forward (`draft → sending → sent`). Any other
    /// transition is rejected with a `Conflict`.
    pub async fn transition_status(
        pool: &SqlitePool,
        id: &str,
        next: CampaignStatus,
    ) -> AppResult<Campaign> {
        let current = Self::find_by_id(pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Campaign {} not found", id)))?;

        let current_status = CampaignStatus::parse(&current.status).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "Campaign {} has unknown status '{}'",
                id,
                current.status
            ))
        })?;

        if !current_status.can_transition_to(next) {
            return Err(AppError::Conflict(format!(
                "Illegal campaign status transition {} -> {}",
                current.status,
                next.as_str()
            )));
        }

        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, Campaign>(&format!(
            r#"
            UPDATE campaigns
            SET status = ?, updated_at = ?
            WHERE id = ? AND status = ?
            RETURNING {COLUMNS}
            "#
        ))
        .bind(next.as_str())
        .bind(now)
        .bind(id)
        .bind(&current.status)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        row.ok_or_else(|| {
            AppError::Conflict(format!("Campaign {} changed status concurrently", id))
        })
    }

    pub async fn set_total_recipients(
        pool: &SqlitePool,
        id: &str,
        total: i64,
    ) -> AppResult<Campaign> {
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, Campaign>(&format!(
            r#"
            UPDATE campaigns
            SET total_recipients = ?, updated_at = ?
            WHERE id = ?
            RETURNING {COLUMNS}
            "#
        ))
        .bind(total)
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }
}
