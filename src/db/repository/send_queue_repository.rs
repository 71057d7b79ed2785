use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateSendTask, SendTask};
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id,
    delivery_record_id,
    recipient_email,
    template_key,
    subject,
    html_content,
    attachments_json,
    attempts,
    max_attempts,
    next_attempt_at,
    last_error,
    status,
    created_at,
    updated_at
"#;

/// Repository for the durable email send queue.
///
/// Claiming uses an atomic single-statement UPDATE with a subselect:
/// `UPDATE ... WHERE id = (SELECT id FROM ... LIMIT 1) RETURNING ...`
/// which avoids a long-lived transaction and keeps contention on SQLite low.
/// Due tasks are claimed in `(next_attempt_at, created_at)` order so first
/// attempts drain in FIFO order.
pub struct SendQueueRepository;

impl SendQueueRepository {
    /// Create a new queued send task.
    ///
    /// `max_attempts` and `next_attempt_at` may be omitted and are defaulted
    /// here (3 attempts, eligible immediately).
    pub async fn create(pool: &SqlitePool, task: CreateSendTask) -> AppResult<SendTask> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let next_attempt_at = task.next_attempt_at.unwrap_or(now);
        let max_attempts = task.max_attempts.unwrap_or(3);

        let row = sqlx::query_as::<_, SendTask>(&format!(
            r#"
            INSERT INTO email_queue (
                id,
                delivery_record_id,
                recipient_email,
                template_key,
                subject,
                html_content,
                attachments_json,
                attempts,
                max_attempts,
                next_attempt_at,
                last_error,
                status,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(task.delivery_record_id)
        .bind(task.recipient_email)
        .bind(task.template_key)
        .bind(task.subject)
        .bind(task.html_content)
        .bind(task.attachments_json)
        .bind(0i32) // attempts
        .bind(max_attempts)
        .bind(next_attempt_at)
        .bind::<Option<String>>(None) // last_error
        .bind("pending")
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Claim up to `limit` due tasks and return them in drain order.
    ///
    /// Atomically claims one task per statement in a loop, so other writers
    /// are never blocked behind a long transaction.
    pub async fn fetch_and_claim_due(pool: &SqlitePool, limit: i64) -> AppResult<Vec<SendTask>> {
        let mut tasks: Vec<SendTask> = Vec::new();
        if limit <= 0 {
            return Ok(tasks);
        }

        for _ in 0..(limit as usize) {
            let now = Utc::now().naive_utc();

            let opt = sqlx::query_as::<_, SendTask>(&format!(
                r#"
                UPDATE email_queue
                SET status = 'processing', updated_at = ?
                WHERE id = (
                    SELECT id FROM email_queue
                    WHERE status = 'pending'
                      AND next_attempt_at <= ?
                    ORDER BY next_attempt_at ASC, created_at ASC
                    LIMIT 1
                )
                RETURNING {COLUMNS}
                "#
            ))
            .bind(now)
            .bind(now)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

            if let Some(task) = opt {
                tasks.push(task);
            } else {
                break;
            }
        }

        Ok(tasks)
    }

    /// Mark a task as succeeded. Returns the updated task row.
    pub async fn mark_succeeded(pool: &SqlitePool, id: &str) -> AppResult<SendTask> {
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, SendTask>(&format!(
            r#"
            UPDATE email_queue
            SET status = 'succeeded', updated_at = ?
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

    /// Increment attempts, set `next_attempt_at` and `last_error`. If the new
    /// attempt count reaches `max_attempts`, the task moves to 'dead'.
    ///
    /// Returns the updated task row.
    pub async fn register_attempt_and_schedule(
        pool: &SqlitePool,
        id: &str,
        next_attempt_at: chrono::NaiveDateTime,
        last_error: Option<String>,
    ) -> AppResult<SendTask> {
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, SendTask>(&format!(
            r#"
            UPDATE email_queue
            SET
                attempts = attempts + 1,
                next_attempt_at = ?,
                last_error = ?,
                status = CASE WHEN attempts + 1 >= max_attempts THEN 'dead' ELSE 'pending' END,
                updated_at = ?
            WHERE id = ?
            RETURNING {COLUMNS}
            "#
        ))
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Mark the task as dead and set the last error.
    pub async fn mark_dead(
        pool: &SqlitePool,
        id: &str,
        last_error: Option<String>,
    ) -> AppResult<SendTask> {
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, SendTask>(&format!(
            r#"
            UPDATE email_queue
            SET status = 'dead', last_error = ?, updated_at = ?
            WHERE id = ?
            RETURNING {COLUMNS}
            "#
        ))
        .bind(last_error)
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    #[allow(dead_code)]
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<SendTask>> {
        let row = sqlx::query_as::<_, SendTask>(&format!(
            "SELECT {COLUMNS} FROM email_queue WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }
}
