use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: String,
    pub name: String,
    /// Unique lookup key, e.g. `booking-confirmation`.
    pub slug: String,
    pub subject: String,
    pub html_content: String,
    /// System templates are seeded lazily from the built-in renderers and are
    /// not deletable through the API.
    pub is_system: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEmailTemplate {
    pub name: String,
    pub slug: String,
    pub subject: String,
    pub html_content: String,
    pub is_system: bool,
}
