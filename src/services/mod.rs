pub mod automation;
pub mod campaigns;
pub mod emails;
pub mod init;
pub mod mailer;
pub mod templates;
