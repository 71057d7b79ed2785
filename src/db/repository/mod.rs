pub mod automation_repository;
pub mod campaign_repository;
pub mod delivery_record_repository;
pub mod email_template_repository;
pub mod scheduled_email_repository;
pub mod send_queue_repository;

pub use automation_repository::{
    AutomationStepRepository, AutomationTriggerRepository, AutomationWorkflowRepository,
    WorkflowResumptionRepository,
};
pub use campaign_repository::CampaignRepository;
pub use delivery_record_repository::DeliveryRecordRepository;
pub use email_template_repository::EmailTemplateRepository;
pub use scheduled_email_repository::ScheduledEmailRepository;
pub use send_queue_repository::SendQueueRepository;
