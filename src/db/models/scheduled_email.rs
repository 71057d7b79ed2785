use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A deferred send: becomes a real delivery once `scheduled_at` is due.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduledEmail {
    pub id: String,
    pub recipient_email: String,
    pub template_slug: String,
    pub template_data: Option<String>,
    pub subject: Option<String>,
    pub scheduled_at: NaiveDateTime,
    /// 'pending', 'sent' or 'failed'
    pub status: String,
    pub sent_at: Option<NaiveDateTime>,
    pub failed_at: Option<NaiveDateTime>,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateScheduledEmail {
    pub recipient_email: String,
    pub template_slug: String,
    pub template_data: Option<String>,
    pub subject: Option<String>,
    pub scheduled_at: NaiveDateTime,
}
