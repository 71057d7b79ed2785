use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of one attempted email send.
///
/// The status only moves forward: `pending → sent → {delivered, opened,
/// clicked, bounced}`, or diverts to `failed` from `pending`/`sent`.
/// `DeliveryRecordRepository::advance_status` is the single write path and
/// refuses regressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Opened => "opened",
            DeliveryStatus::Clicked => "clicked",
            DeliveryStatus::Bounced => "bounced",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "opened" => Some(DeliveryStatus::Opened),
            "clicked" => Some(DeliveryStatus::Clicked),
            "bounced" => Some(DeliveryStatus::Bounced),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    /// Whether a record currently in `self` may move to `next`.
    ///
    /// `failed` is reachable from `pending` and `sent` only; the engagement
    /// states (`delivered`/`opened`/`clicked`/`bounced`) require `sent` first
    /// and never downgrade back to `sent` or `pending`.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;

        if *self == next {
            return false;
        }

        match self {
            Pending => matches!(next, Sent | Failed),
            Sent => matches!(next, Delivered | Opened | Clicked | Bounced | Failed),
            // Engagement states may deepen (delivered -> opened -> clicked)
            // but never step back.
            Delivered => matches!(next, Opened | Clicked | Bounced),
            Opened => matches!(next, Clicked),
            Clicked => false,
            Bounced => false,
            Failed => false,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub recipient_email: String,
    pub template_key: String,

    /// Rendered subject/html snapshot taken at enqueue time, so retries keep
    /// sending the same content even if the template row changes later.
    pub subject: String,
    pub html_content: String,

    pub status: String,

    /// Message id assigned by the SMTP transport once the relay accepts it.
    pub message_id: Option<String>,

    pub error_message: Option<String>,

    /// JSON snapshot of the caller-supplied data bag.
    pub custom_data: Option<String>,

    pub campaign_id: Option<String>,
    pub created_by: Option<String>,

    pub created_at: NaiveDateTime,
    pub sent_at: Option<NaiveDateTime>,
    pub opened_at: Option<NaiveDateTime>,
    pub clicked_at: Option<NaiveDateTime>,
    pub bounced_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeliveryRecord {
    pub recipient_email: String,
    pub template_key: String,
    pub subject: String,
    pub html_content: String,
    pub custom_data: Option<String>,
    pub campaign_id: Option<String>,
    pub created_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        use DeliveryStatus::*;

        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(Failed));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Sent.can_transition_to(Opened));
        assert!(Sent.can_transition_to(Clicked));
        assert!(Sent.can_transition_to(Bounced));

        // Once sent, never back to pending.
        assert!(!Sent.can_transition_to(Pending));
        assert!(!Delivered.can_transition_to(Pending));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Opened.can_transition_to(Delivered));

        // Terminal states.
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Clicked.can_transition_to(Opened));
        assert!(!Bounced.can_transition_to(Sent));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            "pending",
            "sent",
            "delivered",
            "opened",
            "clicked",
            "bounced",
            "failed",
        ] {
            assert_eq!(DeliveryStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(DeliveryStatus::parse("queued").is_none());
    }
}
