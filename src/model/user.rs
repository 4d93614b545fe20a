use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::model::role::{PermissionSet, Role, parse_permissions};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: u64,
    pub email: String,
    pub full_name: String,
    pub password: String,
    pub role_id: u8,
    pub permissions: String,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn role(&self) -> Option<Role> {
        Role::from_id(self.role_id)
    }

    pub fn permission_set(&self) -> PermissionSet {
        parse_permissions(&self.permissions)
    }
}

/// User as shown to clients; never carries the password hash.
#[derive(Debug, Serialize, ToSchema)]
pub struct UserProfile {
    #[schema(example = 7)]
    pub id: u64,
    #[schema(example = "jane@company.com")]
    pub email: String,
    #[schema(example = "Jane Doe")]
    pub full_name: String,
    pub role: Role,
    pub permissions: Vec<crate::model::role::Permission>,
    pub is_active: bool,
    #[schema(value_type = Option<String>, format = "date-time")]
    pub last_login_at: Option<DateTime<Utc>>,
    #[schema(value_type = String, format = "date-time")]
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserProfile {
    fn from(u: User) -> Self {
        let permissions = u.permission_set().into_iter().collect();
        Self {
            id: u.id,
            role: u.role().unwrap_or(Role::Staff),
            email: u.email,
            full_name: u.full_name,
            permissions,
            is_active: u.is_active,
            last_login_at: u.last_login_at,
            created_at: u.created_at,
        }
    }
}
