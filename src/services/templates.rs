use std::collections::HashMap;

use serde_json::Value;
use sqlx::SqlitePool;

use crate::db::{CreateEmailTemplate, EmailTemplateRepository};
use crate::error::{AppError, AppResult};

/// Built-in template identifiers.
///
/// `from_slug` is total: any slug resolves to one of these, with `Custom` as
/// the catch-all. `parse` is the strict variant used where a caller supplies
/// an exact key and a typo should be an error rather than a silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKey {
    BookingConfirmation,
    BookingStatusUpdate,
    PaymentConfirmation,
    BookingCancellation,
    AdminNotification,
    ContactReply,
    Custom,
}

const ALL_KEYS: [TemplateKey; 7] = [
    TemplateKey::BookingConfirmation,
    TemplateKey::BookingStatusUpdate,
    TemplateKey::PaymentConfirmation,
    TemplateKey::BookingCancellation,
    TemplateKey::AdminNotification,
    TemplateKey::ContactReply,
    TemplateKey::Custom,
];

lazy_static::lazy_static! {
    /// Historic and alternate slugs seen in the wild, remapped before the
    /// generic fallback kicks in.
    static ref SLUG_ALIASES: HashMap<&'static str, TemplateKey> = {
        let mut m = HashMap::new();
        m.insert("booking-confirmed", TemplateKey::BookingConfirmation);
        m.insert("confirmation", TemplateKey::BookingConfirmation);
        m.insert("booking-status", TemplateKey::BookingStatusUpdate);
        m.insert("status-update", TemplateKey::BookingStatusUpdate);
        m.insert("payment-receipt", TemplateKey::PaymentConfirmation);
        m.insert("payment-received", TemplateKey::PaymentConfirmation);
        m.insert("booking-cancelled", TemplateKey::BookingCancellation);
        m.insert("cancellation", TemplateKey::BookingCancellation);
        m.insert("admin-alert", TemplateKey::AdminNotification);
        m.insert("contact-response", TemplateKey::ContactReply);
        m
    };
}

impl TemplateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKey::BookingConfirmation => "booking-confirmation",
            TemplateKey::BookingStatusUpdate => "booking-status-update",
            TemplateKey::PaymentConfirmation => "payment-confirmation",
            TemplateKey::BookingCancellation => "booking-cancellation",
            TemplateKey::AdminNotification => "admin-notification",
            TemplateKey::ContactReply => "contact-reply",
            TemplateKey::Custom => "custom",
        }
    }

    pub fn valid_keys() -> Vec<&'static str> {
        ALL_KEYS.iter().map(|k| k.as_str()).collect()
    }

    /// Strict lookup. Unknown keys are an error listing the valid ones.
    pub fn parse(s: &str) -> AppResult<TemplateKey> {
        ALL_KEYS
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| AppError::TemplateNotFound(s.to_string()))
    }

    /// Total slug resolution: exact keys first, then the alias table,
    /// otherwise the generic `Custom` template. Never fails.
    pub fn from_slug(slug: &str) -> TemplateKey {
        let normalized = slug.trim().to_lowercase().replace('_', "-");

        if let Ok(key) = Self::parse(&normalized) {
            return key;
        }
        if let Some(key) = SLUG_ALIASES.get(normalized.as_str()) {
            return *key;
        }
        TemplateKey::Custom
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TemplateKey::BookingConfirmation => "Booking Confirmation",
            TemplateKey::BookingStatusUpdate => "Booking Status Update",
            TemplateKey::PaymentConfirmation => "Payment Confirmation",
            TemplateKey::BookingCancellation => "Booking Cancellation",
            TemplateKey::AdminNotification => "Admin Notification",
            TemplateKey::ContactReply => "Contact Reply",
            TemplateKey::Custom => "Custom Message",
        }
    }
}

/// A rendered email: subject line plus HTML body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub html: String,
}

fn shell(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<body style="margin:0;padding:0;background:#f4f4f5;font-family:Arial,Helvetica,sans-serif;">
  <div style="max-width:600px;margin:0 auto;padding:24px;background:#ffffff;">
    <h2 style="color:#1a3c34;">{title}</h2>
    {body}
    <p style="color:#71717a;font-size:12px;margin-top:32px;">
      You are receiving this email because of a booking or enquiry with us.
    </p>
  </div>
</body>
</html>"#
    )
}

fn builtin_subject(key: TemplateKey) -> &'static str {
    match key {
        TemplateKey::BookingConfirmation => "Your booking {{bookingId}} is confirmed",
        TemplateKey::BookingStatusUpdate => "Update on your booking {{bookingId}}",
        TemplateKey::PaymentConfirmation => "Payment received for booking {{bookingId}}",
        TemplateKey::BookingCancellation => "Your booking {{bookingId}} has been cancelled",
        TemplateKey::AdminNotification => "[Admin] {{title}}",
        TemplateKey::ContactReply => "Re: {{subject}}",
        TemplateKey::Custom => "{{subject}}",
    }
}

fn builtin_html(key: TemplateKey) -> String {
    match key {
        TemplateKey::BookingConfirmation => shell(
            "Booking confirmed",
            r#"<p>Dear {{customerName}},</p>
<p>Your booking <strong>{{bookingId}}</strong> for <strong>{{tourName}}</strong> is confirmed.</p>
<table style="border-collapse:collapse;">
  <tr><td style="padding:4px 12px 4px 0;">Start date</td><td>{{startDate}}</td></tr>
  <tr><td style="padding:4px 12px 4px 0;">End date</td><td>{{endDate}}</td></tr>
  <tr><td style="padding:4px 12px 4px 0;">Participants</td><td>{{participants}}</td></tr>
  <tr><td style="padding:4px 12px 4px 0;">Total amount</td><td>{{totalAmount}}</td></tr>
</table>
<p>We look forward to welcoming you.</p>"#,
        ),
        TemplateKey::BookingStatusUpdate => shell(
            "Booking update",
            r#"<p>Dear {{customerName}},</p>
<p>The status of your booking <strong>{{bookingId}}</strong> changed to
<strong>{{status}}</strong>.</p>
<p>{{message}}</p>"#,
        ),
        TemplateKey::PaymentConfirmation => shell(
            "Payment received",
            r#"<p>Dear {{customerName}},</p>
<p>We received your payment of <strong>{{amount}}</strong> for booking
<strong>{{bookingId}}</strong>. Thank you.</p>"#,
        ),
        TemplateKey::BookingCancellation => shell(
            "Booking cancelled",
            r#"<p>Dear {{customerName}},</p>
<p>Your booking <strong>{{bookingId}}</strong> for {{tourName}} has been cancelled.</p>
<p>{{message}}</p>"#,
        ),
        TemplateKey::AdminNotification => shell(
            "{{title}}",
            r#"<p>{{message}}</p>
<p style="color:#71717a;">Triggered by: {{source}}</p>"#,
        ),
        TemplateKey::ContactReply => shell(
            "Reply to your enquiry",
            r#"<p>Dear {{customerName}},</p>
<p>{{message}}</p>"#,
        ),
        TemplateKey::Custom => shell("{{subject}}", "<p>{{message}}</p>"),
    }
}

/// The seed row written to `email_templates` the first time a key is used,
/// so templates become editable without losing the built-in defaults.
pub fn builtin_template(key: TemplateKey) -> CreateEmailTemplate {
    CreateEmailTemplate {
        name: key.display_name().to_string(),
        slug: key.as_str().to_string(),
        subject: builtin_subject(key).to_string(),
        html_content: builtin_html(key),
        is_system: true,
    }
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Expand `{{placeholder}}` occurrences against the data bag. Placeholders
/// with no matching key are left untouched so a half-filled template is
/// visible rather than silently blanked.
pub fn interpolate(template: &str, data: &Value) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let Some(close_rel) = rest[open + 2..].find("}}") else {
            break;
        };
        let close = open + 2 + close_rel;
        result.push_str(&rest[..open]);

        let name = rest[open + 2..close].trim();
        match data.get(name) {
            Some(value) => result.push_str(&escape_html(&value_to_string(value))),
            None => result.push_str(&rest[open..close + 2]),
        }
        rest = &rest[close + 2..];
    }

    result.push_str(rest);
    result
}

/// Interpolate subject/html templates and clean up an unfilled subject line
/// so we never send "{{subject}}" as the subject.
fn render_content(subject_template: &str, html_template: &str, key: TemplateKey, data: &Value) -> Rendered {
    let subject = interpolate(subject_template, data);
    let html = interpolate(html_template, data);

    let subject = if subject.trim().is_empty() || subject.contains("{{") {
        match key {
            TemplateKey::Custom => "Notification".to_string(),
            other => other.display_name().to_string(),
        }
    } else {
        subject
    };

    Rendered { subject, html }
}

/// Render a template purely from the built-in definitions, with no database
/// round-trip.
pub fn render(key: TemplateKey, data: &Value) -> Rendered {
    render_content(builtin_subject(key), &builtin_html(key), key, data)
}

pub struct TemplateService;

impl TemplateService {
    /// Resolve `slug`, lazily seed the template row on first use, and render
    /// it against `data`. A stored row (possibly admin-edited) takes
    /// precedence over the built-in definition. `explicit_subject` overrides
    /// whatever the template would produce.
    ///
    /// A database error while loading/seeding the row is logged and the
    /// built-in definition is used instead; a template-table hiccup must not
    /// fail the send.
    pub async fn render_for_slug(
        pool: &SqlitePool,
        slug: &str,
        data: &Value,
        explicit_subject: Option<&str>,
    ) -> AppResult<(TemplateKey, Rendered)> {
        let key = TemplateKey::from_slug(slug);

        let mut rendered = match EmailTemplateRepository::get_or_seed(pool, builtin_template(key))
            .await
        {
            Ok(row) => render_content(&row.subject, &row.html_content, key, data),
            Err(e) => {
                tracing::warn!(
                    slug = %key.as_str(),
                    "Falling back to built-in template after store error: {:?}",
                    e
                );
                render(key, data)
            }
        };

        if let Some(subject) = explicit_subject {
            rendered.subject = subject.to_string();
        }

        Ok((key, rendered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_slugs_resolve_to_their_key() {
        assert_eq!(
            TemplateKey::from_slug("booking-confirmation"),
            TemplateKey::BookingConfirmation
        );
        assert_eq!(
            TemplateKey::from_slug("booking_confirmation"),
            TemplateKey::BookingConfirmation
        );
        assert_eq!(
            TemplateKey::from_slug("payment-receipt"),
            TemplateKey::PaymentConfirmation
        );
        assert_eq!(
            TemplateKey::from_slug("ADMIN-ALERT"),
            TemplateKey::AdminNotification
        );
    }

    #[test]
    fn unknown_slugs_fall_back_to_custom_without_error() {
        assert_eq!(TemplateKey::from_slug("no-such-template"), TemplateKey::Custom);
        assert_eq!(TemplateKey::from_slug(""), TemplateKey::Custom);
        assert_eq!(TemplateKey::from_slug("🙂"), TemplateKey::Custom);
    }

    #[test]
    fn strict_parse_lists_valid_keys() {
        let err = TemplateKey::parse("booking-confirmatoin").unwrap_err();
        match err {
            AppError::TemplateNotFound(key) => assert_eq!(key, "booking-confirmatoin"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(TemplateKey::valid_keys().contains(&"booking-confirmation"));
    }

    #[test]
    fn interpolate_fills_known_placeholders_and_keeps_unknown() {
        let data = json!({ "name": "Jane", "count": 3 });
        assert_eq!(
            interpolate("Hi {{name}}, {{count}} spots, {{missing}}!", &data),
            "Hi Jane, 3 spots, {{missing}}!"
        );
    }

    #[test]
    fn interpolate_escapes_html_in_values() {
        let data = json!({ "name": "<script>alert(1)</script>" });
        let out = interpolate("Hi {{name}}", &data);
        assert!(!out.contains("<script>"));
        assert!(out.contains("&lt;script&gt;"));
    }

    #[test]
    fn booking_confirmation_contains_booking_fields() {
        let data = json!({
            "bookingId": "BK100",
            "customerName": "Jane",
            "tourName": "Safari",
            "startDate": "2025-01-01",
            "endDate": "2025-01-05",
            "totalAmount": 500,
            "participants": 2
        });

        let rendered = render(TemplateKey::BookingConfirmation, &data);
        assert!(rendered.html.contains("BK100"));
        assert!(rendered.html.contains("Jane"));
        assert!(rendered.html.contains("Safari"));
        assert!(rendered.subject.contains("BK100"));
    }

    #[test]
    fn custom_template_interpolates_caller_message() {
        let data = json!({ "subject": "Hello", "message": "Your table is ready." });
        let rendered = render(TemplateKey::Custom, &data);
        assert_eq!(rendered.subject, "Hello");
        assert!(rendered.html.contains("Your table is ready."));
    }

    #[test]
    fn custom_template_without_subject_uses_fallback() {
        let rendered = render(TemplateKey::Custom, &json!({ "message": "hi" }));
        assert_eq!(rendered.subject, "Notification");
    }
}
