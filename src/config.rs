use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub smtp: SmtpConfig,
    pub queue: EmailQueueConfig,
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitConfig,
    pub events: EventConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
    /// Base URL this service is reachable at from the outside. Used to build
    /// tracking-pixel and click-redirect links embedded in rendered emails.
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// SMTP relay credentials and sender identity.
///
/// All of these except `port` are required: a mailer without a relay or a
/// from-address cannot deliver anything, so startup fails instead of limping
/// along (see `Config::from_env`).
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailQueueConfig {
    /// Whether the send worker is enabled.
    pub enabled: bool,
    /// How often (seconds) the worker polls for due tasks.
    pub poll_interval_seconds: u64,
    /// Maximum delivery attempts per message before it is marked failed.
    pub max_attempts: u32,
    /// Sends per second; the worker sleeps `1000 / rate` ms between sends.
    pub rate_limit_per_second: u32,
    /// Maximum tasks claimed per polling pass.
    pub batch_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Poll interval (seconds) for due scheduled emails.
    pub scheduled_poll_interval_seconds: u64,
    /// Poll interval (seconds) for due workflow resumptions (wait steps).
    pub resumption_poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for public endpoints
    /// (e.g. /api/emails, /events)
    pub public_per_second: u32,
    /// Burst size for public endpoints
    pub public_burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    /// Shared secret for HMAC verification of inbound automation events.
    /// When unset, /events accepts unsigned payloads.
    pub signing_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
                public_url: env::var("PUBLIC_URL")
                    .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/mailer.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            smtp: SmtpConfig {
                host: env::var("SMTP_HOST")
                    .map_err(|_| ConfigError::MissingEnv("SMTP_HOST".to_string()))?,
                port: env::var("SMTP_PORT")
                    .unwrap_or_else(|_| "587".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("SMTP_PORT".to_string()))?,
                username: env::var("SMTP_USERNAME")
                    .map_err(|_| ConfigError::MissingEnv("SMTP_USERNAME".to_string()))?,
                password: env::var("SMTP_PASSWORD")
                    .map_err(|_| ConfigError::MissingEnv("SMTP_PASSWORD".to_string()))?,
                from_email: env::var("SMTP_FROM_EMAIL")
                    .map_err(|_| ConfigError::MissingEnv("SMTP_FROM_EMAIL".to_string()))?,
                from_name: env::var("SMTP_FROM_NAME")
                    .map_err(|_| ConfigError::MissingEnv("SMTP_FROM_NAME".to_string()))?,
            },
            queue: EmailQueueConfig {
                enabled: match env::var("EMAIL_QUEUE_ENABLED") {
                    Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
                    Err(_) => true,
                },
                poll_interval_seconds: env::var("EMAIL_QUEUE_POLL_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5u64),
                max_attempts: env::var("EMAIL_QUEUE_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3u32),
                rate_limit_per_second: env::var("EMAIL_QUEUE_RATE_PER_SECOND")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2u32),
                batch_size: env::var("EMAIL_QUEUE_BATCH_SIZE")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10u32),
            },
            scheduler: SchedulerConfig {
                scheduled_poll_interval_seconds: env::var("SCHEDULED_EMAIL_POLL_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30u64),
                resumption_poll_interval_seconds: env::var("WORKFLOW_RESUME_POLL_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30u64),
            },
            rate_limit: RateLimitConfig {
                public_per_second: env::var("RATE_LIMIT_PUBLIC_PER_SECOND")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                public_burst: env::var("RATE_LIMIT_PUBLIC_BURST")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50),
            },
            events: EventConfig {
                signing_secret: env::var("EVENTS_SIGNING_SECRET").ok(),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
                public_url: "http://localhost:8080".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/mailer.db".to_string(),
                max_connections: 5,
            },
            smtp: SmtpConfig {
                host: "localhost".to_string(),
                port: 587,
                username: String::new(),
                password: String::new(),
                from_email: "noreply@example.com".to_string(),
                from_name: "Tours".to_string(),
            },
            queue: EmailQueueConfig {
                enabled: true,
                poll_interval_seconds: 5,
                max_attempts: 3,
                rate_limit_per_second: 2,
                batch_size: 10,
            },
            scheduler: SchedulerConfig {
                scheduled_poll_interval_seconds: 30,
                resumption_poll_interval_seconds: 30,
            },
            rate_limit: RateLimitConfig {
                public_per_second: 10,
                public_burst: 50,
            },
            events: EventConfig {
                signing_secret: None,
            },
        }
    }
}
