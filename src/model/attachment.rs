use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumString};
use utoipa::ToSchema;

/// Record types files can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum OwnerKind {
    Lead,
    Candidate,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Attachment {
    pub id: u64,
    #[schema(example = "lead")]
    pub owner_kind: String,
    pub owner_id: u64,
    #[schema(example = "proposal.pdf")]
    pub filename: String,
    #[schema(example = "application/pdf")]
    pub content_type: String,
    pub size_bytes: u64,
    #[serde(skip_serializing)]
    pub storage_key: String,
    pub uploaded_by: u64,
    #[schema(value_type = String, format = "date-time")]
    pub created_at: DateTime<Utc>,
}
