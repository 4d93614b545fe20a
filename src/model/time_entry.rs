use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One clock-in/clock-out session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct TimeEntry {
    #[schema(example = 12)]
    pub id: u64,
    #[schema(example = 3)]
    pub user_id: u64,
    /// Calendar day (business local time) the session was started on
    #[schema(value_type = String, format = "date", example = "2026-03-02")]
    pub work_date: NaiveDate,
    #[schema(value_type = String, format = "date-time")]
    pub clock_in: DateTime<Utc>,
    #[schema(value_type = Option<String>, format = "date-time")]
    pub clock_out: Option<DateTime<Utc>>,
    #[schema(value_type = Option<String>, format = "date-time")]
    pub break_started_at: Option<DateTime<Utc>>,
    /// Seconds spent on finished breaks
    #[schema(example = 1800)]
    pub break_seconds: i64,
    pub note: Option<String>,
}

impl TimeEntry {
    pub fn is_open(&self) -> bool {
        self.clock_out.is_none()
    }

    pub fn on_break(&self) -> bool {
        self.is_open() && self.break_started_at.is_some()
    }
}
