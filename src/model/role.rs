use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use utoipa::ToSchema;

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, ToSchema, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Admin = 1,
    Manager = 2,
    Staff = 3,
}

impl Role {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Role::Admin),
            2 => Some(Role::Manager),
            3 => Some(Role::Staff),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Permissions a freshly created or re-roled user starts with.
    pub fn default_permissions(self) -> PermissionSet {
        match self {
            Role::Admin => Permission::iter().collect(),
            Role::Manager => Permission::iter()
                .filter(|p| *p != Permission::ManageUsers)
                .collect(),
            Role::Staff => [Permission::ViewLeads, Permission::ManageReminders]
                .into_iter()
                .collect(),
        }
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
    ToSchema,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Permission {
    ViewLeads,
    EditLeads,
    ManageRecruitment,
    ViewAllTimesheets,
    ManageReminders,
    ManageUsers,
}

pub type PermissionSet = BTreeSet<Permission>;

/// Parse the comma separated `users.permissions` column. Unknown entries are
/// skipped so a removed permission never locks a user out.
pub fn parse_permissions(raw: &str) -> PermissionSet {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

pub fn format_permissions(set: &PermissionSet) -> String {
    set.iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ids_round_trip() {
        for role in [Role::Admin, Role::Manager, Role::Staff] {
            assert_eq!(Role::from_id(role.id()), Some(role));
        }
        assert_eq!(Role::from_id(0), None);
        assert_eq!(Role::from_id(9), None);
    }

    #[test]
    fn permissions_column_skips_unknown_entries() {
        let set = parse_permissions("view_leads, edit_leads,,launch_rockets");
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec![Permission::ViewLeads, Permission::EditLeads]
        );
    }

    #[test]
    fn permissions_column_is_stable() {
        let set: PermissionSet = [Permission::ManageUsers, Permission::ViewLeads]
            .into_iter()
            .collect();
        assert_eq!(format_permissions(&set), "view_leads,manage_users");
        assert_eq!(parse_permissions(&format_permissions(&set)), set);
    }

    #[test]
    fn manager_defaults_exclude_user_management() {
        let perms = Role::Manager.default_permissions();
        assert!(perms.contains(&Permission::ManageRecruitment));
        assert!(!perms.contains(&Permission::ManageUsers));

        let staff = Role::Staff.default_permissions();
        assert_eq!(staff.len(), 2);
    }

    #[test]
    fn role_parses_from_lowercase_name() {
        assert_eq!("manager".parse::<Role>().unwrap(), Role::Manager);
        assert!("owner".parse::<Role>().is_err());
    }
}
