use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use utoipa::ToSchema;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    ToSchema,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LeadCategory {
    Business,
    Recruitment,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    ToSchema,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Proposal,
    Won,
    Lost,
}

impl LeadStatus {
    /// Won and lost leads drop out of follow-up lists.
    pub fn is_closed(self) -> bool {
        matches!(self, LeadStatus::Won | LeadStatus::Lost)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    ToSchema,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LeadPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Lead {
    #[schema(example = 1)]
    pub id: u64,
    #[schema(example = "business")]
    pub category: String,
    #[schema(example = "Dana Whitfield")]
    pub name: String,
    #[schema(example = "Whitfield Logistics")]
    pub company: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[schema(example = "referral")]
    pub source: Option<String>,
    #[schema(example = "contacted")]
    pub status: String,
    #[schema(example = "high")]
    pub priority: String,
    pub assigned_to: Option<u64>,
    #[schema(value_type = Option<String>, format = "date")]
    pub next_follow_up: Option<NaiveDate>,
    pub notes: Option<String>,
    pub created_by: u64,
    #[schema(value_type = String, format = "date-time")]
    pub created_at: DateTime<Utc>,
    #[schema(value_type = String, format = "date-time")]
    pub updated_at: DateTime<Utc>,
}
