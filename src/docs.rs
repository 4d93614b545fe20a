use crate::api::clock::{ClockInReq, ClockStatus, EditEntryReq};
use crate::api::leads::{AssignReq, CreateLeadReq, LeadPriorityReq, LeadSort, LeadStatusReq};
use crate::api::notifications::BroadcastReq;
use crate::api::recruitment::{CreateCandidateReq, MoveCandidateReq, MoveStageReq, StageReq};
use crate::api::reminders::CreateReminderReq;
use crate::api::users::{ResetPasswordReq, SetActiveReq, SetPermissionsReq, SetRoleReq};
use crate::model::attachment::Attachment;
use crate::model::lead::{Lead, LeadCategory, LeadPriority, LeadStatus};
use crate::model::notification::{Notification, NotificationKind};
use crate::model::pipeline::{Candidate, Stage};
use crate::model::reminder::{Reminder, ReminderScope};
use crate::model::role::{Permission, Role};
use crate::model::time_entry::TimeEntry;
use crate::model::user::UserProfile;
use crate::models::{ChangePasswordReq, LoginReqDto, RegisterReq, TokenPair};
use crate::recruitment::StageColumn;
use crate::timeclock::{MergedEntry, UserSummary};
use utoipa::Modify;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{OpenApi, openapi};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Ops Dashboard API",
        version = "1.0.0",
        description = r#"
## Internal operations dashboard

Back office API for a small team.

### Key Features
- **Time clock**
  - Clock in and out, breaks, merged daily entries and per-user reports
- **Leads**
  - Business and recruitment leads with status, priority, follow-ups and files
- **Recruitment**
  - Kanban board of stages and candidates with drag-and-drop moves
- **Reminders & notifications**
  - Personal reminders delivered as in-app notifications
- **Users**
  - Roles, per-user permissions and account administration

### Security
Every `/api` endpoint expects a **JWT Bearer** access token issued by `/auth/login`.
Admins pass every permission check; everyone else needs the explicit grant.

### Response Format
- JSON bodies, errors as `{"message": "..."}`
- `page` / `per_page` pagination on list endpoints
"#,
    ),
    paths(
        crate::auth::handlers::register,
        crate::auth::handlers::login,
        crate::auth::handlers::refresh_token,
        crate::auth::handlers::logout,
        crate::auth::handlers::me,
        crate::auth::handlers::change_password,

        crate::api::users::list_users,
        crate::api::users::get_user,
        crate::api::users::set_role,
        crate::api::users::set_active,
        crate::api::users::set_permissions,
        crate::api::users::toggle_permission,
        crate::api::users::reset_password,
        crate::api::users::delete_user,

        crate::api::clock::clock_in,
        crate::api::clock::clock_out,
        crate::api::clock::start_break,
        crate::api::clock::end_break,
        crate::api::clock::status,
        crate::api::clock::list_entries,
        crate::api::clock::list_sessions,
        crate::api::clock::report,
        crate::api::clock::edit_entry,
        crate::api::clock::delete_entry,

        crate::api::leads::create_lead,
        crate::api::leads::list_leads,
        crate::api::leads::get_lead,
        crate::api::leads::update_lead,
        crate::api::leads::set_status,
        crate::api::leads::set_priority,
        crate::api::leads::assign,
        crate::api::leads::lead_stats,
        crate::api::leads::delete_lead,
        crate::api::leads::upload_attachment,
        crate::api::leads::list_attachments,

        crate::api::recruitment::board,
        crate::api::recruitment::create_stage,
        crate::api::recruitment::rename_stage,
        crate::api::recruitment::move_stage,
        crate::api::recruitment::delete_stage,
        crate::api::recruitment::create_candidate,
        crate::api::recruitment::get_candidate,
        crate::api::recruitment::update_candidate,
        crate::api::recruitment::move_candidate,
        crate::api::recruitment::delete_candidate,
        crate::api::recruitment::upload_attachment,
        crate::api::recruitment::list_attachments,

        crate::api::attachments::download,
        crate::api::attachments::delete,

        crate::api::reminders::create_reminder,
        crate::api::reminders::list_reminders,
        crate::api::reminders::get_reminder,
        crate::api::reminders::update_reminder,
        crate::api::reminders::complete_reminder,
        crate::api::reminders::delete_reminder,

        crate::api::notifications::list_notifications,
        crate::api::notifications::unread_count,
        crate::api::notifications::mark_read,
        crate::api::notifications::mark_unread,
        crate::api::notifications::mark_all_read,
        crate::api::notifications::delete_notification,
        crate::api::notifications::broadcast
    ),
    components(
        schemas(
            RegisterReq,
            LoginReqDto,
            ChangePasswordReq,
            TokenPair,
            Role,
            Permission,
            UserProfile,
            SetRoleReq,
            SetActiveReq,
            SetPermissionsReq,
            ResetPasswordReq,
            TimeEntry,
            MergedEntry,
            UserSummary,
            ClockInReq,
            ClockStatus,
            EditEntryReq,
            Lead,
            LeadCategory,
            LeadStatus,
            LeadPriority,
            LeadSort,
            CreateLeadReq,
            LeadStatusReq,
            LeadPriorityReq,
            AssignReq,
            Attachment,
            Stage,
            Candidate,
            StageColumn,
            StageReq,
            MoveStageReq,
            CreateCandidateReq,
            MoveCandidateReq,
            Reminder,
            ReminderScope,
            CreateReminderReq,
            Notification,
            NotificationKind,
            BroadcastReq
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Auth", description = "Registration, login and own account"),
        (name = "Users", description = "User administration APIs"),
        (name = "Clock", description = "Time clock APIs"),
        (name = "Leads", description = "Lead tracking APIs"),
        (name = "Recruitment", description = "Recruitment pipeline APIs"),
        (name = "Attachments", description = "Stored file APIs"),
        (name = "Reminders", description = "Personal reminder APIs"),
        (name = "Notifications", description = "In-app notification APIs"),
    )
)]
pub struct ApiDoc;

pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_carries_bearer_scheme_and_core_paths() {
        let doc = ApiDoc::openapi();
        let components = doc.components.as_ref().unwrap();
        assert!(components.security_schemes.contains_key("bearer_auth"));

        for path in ["/auth/login", "/api/clock/in", "/api/leads", "/api/recruitment/board"] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
