use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateDeliveryRecord, DeliveryRecord, DeliveryStatus};
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id,
    recipient_email,
    template_key,
    subject,
    html_content,
    status,
    message_id,
    error_message,
    custom_data,
    campaign_id,
    created_by,
    created_at,
    sent_at,
    opened_at,
    clicked_at,
    bounced_at
"#;

pub struct DeliveryRecordRepository;

impl DeliveryRecordRepository {
    /// Create a new delivery record in `pending` state.
    pub async fn create(
        pool: &SqlitePool,
        record: CreateDeliveryRecord,
    ) -> AppResult<DeliveryRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r#"
            INSERT INTO delivery_records (
                id,
                recipient_email,
                template_key,
                subject,
                html_content,
                status,
                message_id,
                error_message,
                custom_data,
                campaign_id,
                created_by,
                created_at
            ) VALUES (?, ?, ?, ?, ?, 'pending', NULL, NULL, ?, ?, ?, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(record.recipient_email)
        .bind(record.template_key)
        .bind(record.subject)
        .bind(record.html_content)
        .bind(record.custom_data)
        .bind(record.campaign_id)
        .bind(record.created_by)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<DeliveryRecord>> {
        let row = sqlx::query_as::<_, DeliveryRecord>(&format!(
            "SELECT {COLUMNS} FROM delivery_records WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Look a record up by the message id the transport assigned. Used by
    /// bounce callbacks, which identify messages that way.
    pub async fn find_by_message_id(
        pool: &SqlitePool,
        message_id: &str,
    ) -> AppResult<Option<DeliveryRecord>> {
        let row = sqlx::query_as::<_, DeliveryRecord>(&format!(
            "SELECT {COLUMNS} FROM delivery_records WHERE message_id = ?"
        ))
        .bind(message_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// List delivery records with optional filters and pagination, newest first.
    pub async fn list_with_filters(
        pool: &SqlitePool,
        limit: i64,
        offset: i64,
        status: Option<&str>,
        template_key: Option<&str>,
        recipient: Option<&str>,
        campaign_id: Option<&str>,
    ) -> AppResult<Vec<DeliveryRecord>> {
        let rows = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r#"
            SELECT {COLUMNS} FROM delivery_records
            WHERE (? IS NULL OR status = ?)
              AND (? IS NULL OR template_key = ?)
              AND (? IS NULL OR recipient_email = ?)
              AND (? IS NULL OR campaign_id = ?)
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(status)
        .bind(status)
        .bind(template_key)
        .bind(template_key)
        .bind(recipient)
        .bind(recipient)
        .bind(campaign_id)
        .bind(campaign_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn count_with_filters(
        pool: &SqlitePool,
        status: Option<&str>,
        template_key: Option<&str>,
        recipient: Option<&str>,
        campaign_id: Option<&str>,
    ) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM delivery_records
            WHERE (? IS NULL OR status = ?)
              AND (? IS NULL OR template_key = ?)
              AND (? IS NULL OR recipient_email = ?)
              AND (? IS NULL OR campaign_id = ?)
            "#,
        )
        .bind(status)
        .bind(status)
        .bind(template_key)
        .bind(template_key)
        .bind(recipient)
        .bind(recipient)
        .bind(campaign_id)
        .bind(campaign_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(count)
    }

    pub async fn count_by_status(pool: &SqlitePool, status: &str) -> AppResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM delivery_records WHERE status = ?")
                .bind(status)
                .fetch_one(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(count)
    }

    /// Counts grouped by template key.
    pub async fn counts_by_template(
        pool: &SqlitePool,
    ) -> AppResult<std::collections::HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT template_key, COUNT(*) FROM delivery_records GROUP BY template_key",
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows.into_iter().collect())
    }

    /// Move a record forward along its lifecycle.
    ///
    /// Rejects transitions that would regress the status (e.g. `sent` back to
    /// `pending`, or `clicked` down to `opened`) with a `Conflict`. The
    /// per-state timestamp column is stamped together with the status.
    pub async fn advance_status(
        pool: &SqlitePool,
        id: &str,
        next: DeliveryStatus,
        error_message: Option<&str>,
    ) -> AppResult<DeliveryRecord> {
        let current = Self::find_by_id(pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Delivery record {} not found", id)))?;

        let current_status = DeliveryStatus::parse(&current.status).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "Delivery record {} has unknown status '{}'",
                id,
                current.status
            ))
        })?;

        if !current_status.can_transition_to(next) {
            return Err(AppError::Conflict(format!(
                "Illegal delivery status transition {} -> {}",
                current.status,
                next.as_str()
            )));
        }

        let now = Utc::now().naive_utc();
        let next_str = next.as_str();

        // The WHERE clause re-checks the old status so a concurrent writer
        // cannot sneak a regression in between the read and the update.
        let row = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r#"
            UPDATE delivery_records
            SET
                status = ?,
                error_message = COALESCE(?, error_message),
                sent_at    = CASE WHEN ? = 'sent'    THEN ? ELSE sent_at    END,
                opened_at  = CASE WHEN ? = 'opened'  THEN ? ELSE opened_at  END,
                clicked_at = CASE WHEN ? = 'clicked' THEN ? ELSE clicked_at END,
                bounced_at = CASE WHEN ? = 'bounced' THEN ? ELSE bounced_at END
            WHERE id = ? AND status = ?
            RETURNING {COLUMNS}
            "#
        ))
        .bind(next_str)
        .bind(error_message)
        .bind(next_str)
        .bind(now)
        .bind(next_str)
        .bind(now)
        .bind(next_str)
        .bind(now)
        .bind(next_str)
        .bind(now)
        .bind(id)
        .bind(&current.status)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        row.ok_or_else(|| {
            AppError::Conflict(format!(
                "Delivery record {} changed status concurrently",
                id
            ))
        })
    }

    /// Record a successful handoff to the relay: status `sent` plus the
    /// transport-assigned message id.
    pub async fn mark_sent(
        pool: &SqlitePool,
        id: &str,
        message_id: &str,
    ) -> AppResult<DeliveryRecord> {
        let record = Self::advance_status(pool, id, DeliveryStatus::Sent, None).await?;

        let row = sqlx::query_as::<_, DeliveryRecord>(&format!(
            "UPDATE delivery_records SET message_id = ? WHERE id = ? RETURNING {COLUMNS}"
        ))
        .bind(message_id)
        .bind(&record.id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn mark_failed(
        pool: &SqlitePool,
        id: &str,
        error_message: &str,
    ) -> AppResult<DeliveryRecord> {
        Self::advance_status(pool, id, DeliveryStatus::Failed, Some(error_message)).await
    }
}
