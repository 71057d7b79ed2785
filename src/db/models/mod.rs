//! Database models split into separate files.
//! This module re-exports individual model modules so imports like
//! `use crate::db::models::*;` work across the crate.

pub mod automation;
pub mod campaign;
pub mod delivery_record;
pub mod email_template;
pub mod scheduled_email;
pub mod send_task;

pub use self::automation::*;
pub use self::campaign::*;
pub use self::delivery_record::*;
pub use self::email_template::*;
pub use self::scheduled_email::*;
pub use self::send_task::*;
