use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One durable send task in the email queue.
///
/// Every enqueued email gets a row here alongside its `DeliveryRecord`. The
/// background worker claims due rows, attempts delivery through the SMTP
/// transport and either marks the task `succeeded` or reschedules it with
/// exponential backoff. A task whose attempts reach `max_attempts` moves to
/// `dead` and its delivery record is marked `failed` permanently.
///
/// Rendered subject/html are stored on the task so retransmits are consistent
/// even if the template row changes between attempts.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SendTask {
    /// Primary key (UUID)
    pub id: String,

    /// The delivery record this task reports into.
    pub delivery_record_id: String,

    pub recipient_email: String,
    pub template_key: String,
    pub subject: String,
    pub html_content: String,

    /// JSON-serialized list of attachments (filename, content type, base64
    /// content), if any were supplied with the send request.
    pub attachments_json: Option<String>,

    /// Number of attempts already made.
    pub attempts: i32,

    /// Maximum attempts permitted before the task is moved to `dead`.
    pub max_attempts: i32,

    /// Timestamp when the task becomes eligible for its next attempt.
    pub next_attempt_at: NaiveDateTime,

    /// Last error message observed when an attempt failed (if any).
    pub last_error: Option<String>,

    /// Task status: 'pending', 'processing', 'succeeded', 'dead'
    pub status: String,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Data required to create a new send task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSendTask {
    pub delivery_record_id: String,
    pub recipient_email: String,
    pub template_key: String,
    pub subject: String,
    pub html_content: String,
    pub attachments_json: Option<String>,

    /// Optional override for maximum attempts; repository defaults this.
    pub max_attempts: Option<i32>,

    /// Optional explicit schedule for the first attempt; defaults to now.
    pub next_attempt_at: Option<NaiveDateTime>,
}
