use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateScheduledEmail, ScheduledEmail};
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id,
    recipient_email,
    template_slug,
    template_data,
    subject,
    scheduled_at,
    status,
    sent_at,
    failed_at,
    error_message,
    created_at
"#;

pub struct ScheduledEmailRepository;

impl ScheduledEmailRepository {
    pub async fn create(
        pool: &SqlitePool,
        scheduled: CreateScheduledEmail,
    ) -> AppResult<ScheduledEmail> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, ScheduledEmail>(&format!(
            r#"
            INSERT INTO scheduled_emails (
                id, recipient_email, template_slug, template_data, subject,
                scheduled_at, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(scheduled.recipient_email)
        .bind(scheduled.template_slug)
        .bind(scheduled.template_data)
        .bind(scheduled.subject)
        .bind(scheduled.scheduled_at)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Pending rows whose `scheduled_at` has passed, oldest first.
    pub async fn fetch_due(pool: &SqlitePool, limit: i64) -> AppResult<Vec<ScheduledEmail>> {
        let now = Utc::now().naive_utc();

        let rows = sqlx::query_as::<_, ScheduledEmail>(&format!(
            r#"
            SELECT {COLUMNS} FROM scheduled_emails
            WHERE status = 'pending' AND scheduled_at <= ?
            ORDER BY scheduled_at ASC
            LIMIT ?
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn mark_sent(pool: &SqlitePool, id: &str) -> AppResult<ScheduledEmail> {
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, ScheduledEmail>(&format!(
            r#"
            UPDATE scheduled_emails
            SET status = 'sent', sent_at = ?
            WHERE id = ?
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn mark_failed(
        pool: &SqlitePool,
        id: &str,
        error_message: &str,
    ) -> AppResult<ScheduledEmail> {
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, ScheduledEmail>(&format!(
            r#"
            UPDATE scheduled_emails
            SET status = 'failed', failed_at = ?, error_message = ?
            WHERE id = ?
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(error_message)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list(pool: &SqlitePool, limit: i64, offset: i64) -> AppResult<Vec<ScheduledEmail>> {
        let rows = sqlx::query_as::<_, ScheduledEmail>(&format!(
            r#"
            SELECT {COLUMNS} FROM scheduled_emails
            ORDER BY scheduled_at ASC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
