use async_trait::async_trait;
use base64::Engine;
use lettre::{
    message::{
        header::{ContentDisposition, ContentType},
        Body, Mailbox, MultiPart, SinglePart,
    },
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Base64-encoded file content.
    pub content: String,
}

/// Everything the transport needs to put one message on the wire.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub attachments: Vec<Attachment>,
}

/// Seam between the queue worker and the actual SMTP client, so worker and
/// engine logic can be exercised against an in-memory transport in tests.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver one message; returns the message id on success.
    async fn send(&self, outgoing: &Outgoing) -> AppResult<String>;
}

/// Pooled SMTP client.
///
/// The inner transport is kept behind an `RwLock` so it can be recreated
/// in place after a send failure; there is no circuit breaker, a failed send
/// simply rebuilds the connection pool inline before the next attempt.
pub struct Mailer {
    config: SmtpConfig,
    transport: RwLock<AsyncSmtpTransport<Tokio1Executor>>,
}

impl Mailer {
    pub fn new(config: &SmtpConfig) -> AppResult<Self> {
        let transport = Self::build_transport(config)?;
        Ok(Self {
            config: config.clone(),
            transport: RwLock::new(transport),
        })
    }

    fn build_transport(config: &SmtpConfig) -> AppResult<AsyncSmtpTransport<Tokio1Executor>> {
        let tls_params = TlsParameters::new(config.host.clone())?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .tls(Tls::Required(tls_params))
            .build();

        Ok(transport)
    }

    /// Check that the relay accepts our credentials. Called once at startup;
    /// a refusal aborts the whole service rather than letting it run as a
    /// mailer that cannot mail.
    pub async fn verify(&self) -> AppResult<()> {
        let ok = self.transport.read().await.test_connection().await?;
        if !ok {
            return Err(AppError::ServiceUnavailable(
                "SMTP relay refused the connection".to_string(),
            ));
        }
        Ok(())
    }

    /// Recreate the pooled connection after a send failure.
    pub async fn rebuild(&self) -> AppResult<()> {
        let fresh = Self::build_transport(&self.config)?;
        *self.transport.write().await = fresh;
        tracing::info!("SMTP transport recreated after failure");
        Ok(())
    }

    fn build_message(&self, outgoing: &Outgoing) -> AppResult<(Message, String)> {
        let from: Mailbox = format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(AppError::Address)?;
        let to: Mailbox = outgoing.to.parse().map_err(AppError::Address)?;

        let message_id = format!("<{}@{}>", Uuid::new_v4(), self.config.host);

        let html_part = SinglePart::builder()
            .header(ContentType::TEXT_HTML)
            .body(outgoing.html.clone());

        let mut multipart = MultiPart::mixed().singlepart(html_part);

        for attachment in &outgoing.attachments {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&attachment.content)
                .map_err(|e| {
                    AppError::Validation(format!(
                        "Attachment '{}' is not valid base64: {}",
                        attachment.filename, e
                    ))
                })?;

            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                AppError::Validation(format!(
                    "Attachment '{}' has invalid content type: {}",
                    attachment.filename, e
                ))
            })?;

            let part = SinglePart::builder()
                .header(content_type)
                .header(ContentDisposition::attachment(&attachment.filename))
                .body(Body::new(bytes));
            multipart = multipart.singlepart(part);
        }

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(&outgoing.subject)
            .message_id(Some(message_id.clone()))
            .multipart(multipart)
            .map_err(AppError::Message)?;

        Ok((message, message_id))
    }
}

#[async_trait]
impl Transport for Mailer {
    async fn send(&self, outgoing: &Outgoing) -> AppResult<String> {
        let (message, message_id) = self.build_message(outgoing)?;

        self.transport
            .read()
            .await
            .send(message)
            .await
            .map_err(AppError::Smtp)?;

        tracing::debug!(to = %outgoing.to, message_id = %message_id, "Message accepted by relay");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "mailer@example.com".to_string(),
            password: "secret".to_string(),
            from_email: "noreply@example.com".to_string(),
            from_name: "Tours".to_string(),
        }
    }

    #[tokio::test]
    async fn builds_message_with_attachment() {
        let mailer = Mailer::new(&test_config()).unwrap();

        let outgoing = Outgoing {
            to: "jane@example.com".to_string(),
            subject: "Test".to_string(),
            html: "<p>Hello</p>".to_string(),
            attachments: vec![Attachment {
                filename: "itinerary.txt".to_string(),
                content_type: "text/plain".to_string(),
                content: base64::engine::general_purpose::STANDARD.encode("day 1: arrive"),
            }],
        };

        let (_, message_id) = mailer.build_message(&outgoing).unwrap();
        assert!(message_id.starts_with('<'));
        assert!(message_id.contains("smtp.example.com"));
    }

    #[tokio::test]
    async fn rejects_invalid_recipient_address() {
        let mailer = Mailer::new(&test_config()).unwrap();

        let outgoing = Outgoing {
            to: "not-an-address".to_string(),
            subject: "Test".to_string(),
            html: "<p>Hello</p>".to_string(),
            attachments: Vec::new(),
        };

        assert!(matches!(
            mailer.build_message(&outgoing),
            Err(AppError::Address(_))
        ));
    }

    #[tokio::test]
    async fn rejects_bad_base64_attachment() {
        let mailer = Mailer::new(&test_config()).unwrap();

        let outgoing = Outgoing {
            to: "jane@example.com".to_string(),
            subject: "Test".to_string(),
            html: "<p>Hello</p>".to_string(),
            attachments: vec![Attachment {
                filename: "broken.bin".to_string(),
                content_type: "application/octet-stream".to_string(),
                content: "%%% not base64 %%%".to_string(),
            }],
        };

        assert!(matches!(
            mailer.build_message(&outgoing),
            Err(AppError::Validation(_))
        ));
    }
}
