use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Stage {
    pub id: u64,
    #[schema(example = "Interview")]
    pub name: String,
    pub position: u32,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Candidate {
    pub id: u64,
    pub stage_id: u64,
    pub position: u32,
    #[schema(example = "Sam Rivera")]
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[schema(example = "Warehouse lead")]
    pub role_applied: Option<String>,
    pub lead_id: Option<u64>,
    pub notes: Option<String>,
    #[schema(value_type = String, format = "date-time")]
    pub created_at: DateTime<Utc>,
    #[schema(value_type = String, format = "date-time")]
    pub updated_at: DateTime<Utc>,
}
