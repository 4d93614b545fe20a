pub mod attachments;
pub mod clock;
pub mod leads;
pub mod notifications;
pub mod recruitment;
pub mod reminders;
pub mod users;
