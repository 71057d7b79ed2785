use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Campaign status moves forward only: `draft → sending → sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Sending,
    Sent,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "sending" => Some(CampaignStatus::Sending),
            "sent" => Some(CampaignStatus::Sent),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        matches!(
            (self, next),
            (CampaignStatus::Draft, CampaignStatus::Sending)
                | (CampaignStatus::Sending, CampaignStatus::Sent)
        )
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub template_key: String,
    pub subject: Option<String>,
    pub custom_data: Option<String>,
    pub scheduled_at: Option<NaiveDateTime>,
    pub status: String,
    pub total_recipients: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaign {
    pub name: String,
    pub template_key: String,
    pub subject: Option<String>,
    pub custom_data: Option<String>,
    pub scheduled_at: Option<NaiveDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_status_is_forward_only() {
        use CampaignStatus::*;

        assert!(Draft.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Sent));
        assert!(!Draft.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Sending));
        assert!(!Sent.can_transition_to(Draft));
        assert!(!Sending.can_transition_to(Draft));
    }
}
