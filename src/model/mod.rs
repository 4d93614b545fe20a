pub mod attachment;
pub mod lead;
pub mod notification;
pub mod pipeline;
pub mod reminder;
pub mod role;
pub mod time_entry;
pub mod user;
