use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateEmailTemplate, EmailTemplate};
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id,
    name,
    slug,
    subject,
    html_content,
    is_system,
    created_at,
    updated_at
"#;

pub struct EmailTemplateRepository;

impl EmailTemplateRepository {
    pub async fn create(
        pool: &SqlitePool,
        template: CreateEmailTemplate,
    ) -> AppResult<EmailTemplate> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, EmailTemplate>(&format!(
            r#"
            INSERT INTO email_templates (
                id, name, slug, subject, html_content, is_system, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(template.name)
        .bind(template.slug)
        .bind(template.subject)
        .bind(template.html_content)
        .bind(template.is_system)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_slug(pool: &SqlitePool, slug: &str) -> AppResult<Option<EmailTemplate>> {
        let row = sqlx::query_as::<_, EmailTemplate>(&format!(
            "SELECT {COLUMNS} FROM email_templates WHERE slug = ?"
        ))
        .bind(slug)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Fetch the template for `slug`, seeding it from the built-in defaults on
    /// first use. The insert ignores conflicts so concurrent first uses are
    /// harmless.
    pub async fn get_or_seed(
        pool: &SqlitePool,
        template: CreateEmailTemplate,
    ) -> AppResult<EmailTemplate> {
        if let Some(existing) = Self::find_by_slug(pool, &template.slug).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            INSERT INTO email_templates (
                id, name, slug, subject, html_content, is_system, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(slug) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(&template.name)
        .bind(&template.slug)
        .bind(&template.subject)
        .bind(&template.html_content)
        .bind(template.is_system)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        let row = Self::find_by_slug(pool, &template.slug).await?.ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "Template '{}' missing immediately after seed",
                template.slug
            ))
        })?;

        Ok(row)
    }

    pub async fn list(pool: &SqlitePool) -> AppResult<Vec<EmailTemplate>> {
        let rows = sqlx::query_as::<_, EmailTemplate>(&format!(
            "SELECT {COLUMNS} FROM email_templates ORDER BY slug ASC"
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Update subject/html for an existing slug. Returns the updated row.
    pub async fn update_content(
        pool: &SqlitePool,
        slug: &str,
        subject: &str,
        html_content: &str,
    ) -> AppResult<EmailTemplate> {
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, EmailTemplate>(&format!(
            r#"
            UPDATE email_templates
            SET subject = ?, html_content = ?, updated_at = ?
            WHERE slug = ?
            RETURNING {COLUMNS}
            "#
        ))
        .bind(subject)
        .bind(html_content)
        .bind(now)
        .bind(slug)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        row.ok_or_else(|| AppError::NotFound(format!("Template '{}' not found", slug)))
    }
}
