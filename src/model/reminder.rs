use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Reminder {
    pub id: u64,
    pub user_id: u64,
    #[schema(example = "Send contract to Dana")]
    pub title: String,
    pub body: Option<String>,
    #[schema(value_type = String, format = "date-time")]
    pub due_at: DateTime<Utc>,
    pub done: bool,
    #[schema(value_type = Option<String>, format = "date-time")]
    pub notified_at: Option<DateTime<Utc>>,
    pub lead_id: Option<u64>,
    #[schema(value_type = String, format = "date-time")]
    pub created_at: DateTime<Utc>,
}

/// Which reminders a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ToSchema, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReminderScope {
    /// Not done, due in the future
    #[default]
    Upcoming,
    /// Not done, already due
    Overdue,
    Done,
    All,
}

impl ReminderScope {
    /// WHERE fragment; the caller binds `now` once when `needs_now` is true.
    pub fn condition(self) -> Option<&'static str> {
        match self {
            ReminderScope::Upcoming => Some("done = FALSE AND due_at > ?"),
            ReminderScope::Overdue => Some("done = FALSE AND due_at <= ?"),
            ReminderScope::Done => Some("done = TRUE"),
            ReminderScope::All => None,
        }
    }

    pub fn needs_now(self) -> bool {
        matches!(self, ReminderScope::Upcoming | ReminderScope::Overdue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_bound_scopes_need_now() {
        assert!(ReminderScope::Upcoming.needs_now());
        assert!(ReminderScope::Overdue.needs_now());
        assert!(!ReminderScope::Done.needs_now());
        assert_eq!(ReminderScope::All.condition(), None);
    }

    #[test]
    fn scope_parses_from_query_value() {
        let scope: ReminderScope = serde_json::from_str("\"overdue\"").unwrap();
        assert_eq!(scope, ReminderScope::Overdue);
        assert_eq!(ReminderScope::default(), ReminderScope::Upcoming);
    }
}
