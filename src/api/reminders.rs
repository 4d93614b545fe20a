use actix_web::{HttpResponse, web};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sqlx::MySqlPool;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::{
    auth::auth::AuthUser,
    error::{ApiError, ApiResult},
    model::{
        reminder::{Reminder, ReminderScope},
        role::Permission,
    },
    utils::{
        db_utils::{build_update_sql, execute_update},
        pagination::{Page, Paginated},
    },
};

const REMINDER_COLUMNS: &str =
    "id, user_id, title, body, due_at, done, notified_at, lead_id, created_at";
const REMINDER_UPDATABLE: &[&str] = &["title", "body", "due_at", "lead_id"];

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateReminderReq {
    #[schema(example = "Send contract to Dana")]
    pub title: String,
    pub body: Option<String>,
    #[schema(value_type = String, format = "date-time")]
    pub due_at: DateTime<Utc>,
    pub lead_id: Option<u64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ReminderQuery {
    #[param(value_type = Option<String>, example = "overdue")]
    pub scope: Option<ReminderScope>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// Upcoming reminders read soonest first; everything else newest first.
fn order_for(scope: ReminderScope) -> &'static str {
    match scope {
        ReminderScope::Upcoming => "due_at ASC, id ASC",
        ReminderScope::Overdue | ReminderScope::Done | ReminderScope::All => "due_at DESC, id DESC",
    }
}

fn validate_patch(patch: &Map<String, Value>) -> ApiResult<()> {
    if let Some(title) = patch.get("title") {
        if !matches!(title.as_str(), Some(t) if !t.trim().is_empty()) {
            return Err(ApiError::bad_request("Title must not be empty"));
        }
    }
    if let Some(due) = patch.get("due_at") {
        let parsed = due.as_str().map(DateTime::parse_from_rfc3339);
        if !matches!(parsed, Some(Ok(_))) {
            return Err(ApiError::bad_request("due_at must be an RFC 3339 timestamp"));
        }
    }
    Ok(())
}

async fn fetch_own(pool: &MySqlPool, user_id: u64, id: u64) -> ApiResult<Reminder> {
    let sql = format!("SELECT {REMINDER_COLUMNS} FROM reminders WHERE id = ? AND user_id = ?");
    sqlx::query_as::<_, Reminder>(&sql)
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Reminder"))
}

#[utoipa::path(
    post,
    path = "/api/reminders",
    request_body = CreateReminderReq,
    responses((status = 201, description = "Reminder created", body = Reminder), (status = 400, description = "Invalid input")),
    security(("bearer_auth" = [])),
    tag = "Reminders"
)]
pub async fn create_reminder(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    body: web::Json<CreateReminderReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageReminders)?;

    let title = body.title.trim();
    if title.is_empty() {
        return Err(ApiError::bad_request("Title must not be empty"));
    }

    let inserted = sqlx::query(
        "INSERT INTO reminders (user_id, title, body, due_at, lead_id) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(auth.user_id)
    .bind(title)
    .bind(&body.body)
    .bind(body.due_at)
    .bind(body.lead_id)
    .execute(pool.get_ref())
    .await?;

    let reminder = fetch_own(pool.get_ref(), auth.user_id, inserted.last_insert_id()).await?;
    info!(reminder_id = reminder.id, user_id = auth.user_id, due_at = %reminder.due_at, "Reminder created");
    Ok(HttpResponse::Created().json(reminder))
}

#[utoipa::path(
    get,
    path = "/api/reminders",
    params(ReminderQuery),
    responses((status = 200, description = "Own reminders in the requested scope", body = [Reminder])),
    security(("bearer_auth" = [])),
    tag = "Reminders"
)]
pub async fn list_reminders(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<ReminderQuery>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageReminders)?;

    let scope = query.scope.unwrap_or_default();
    let page = Page::new(query.page, query.per_page);
    let now = Utc::now();

    let condition = scope
        .condition()
        .map(|c| format!(" AND {c}"))
        .unwrap_or_default();

    let count_sql = format!("SELECT COUNT(*) FROM reminders WHERE user_id = ?{condition}");
    let mut count_q = sqlx::query_scalar::<_, i64>(&count_sql).bind(auth.user_id);
    if scope.needs_now() {
        count_q = count_q.bind(now);
    }
    let total = count_q.fetch_one(pool.get_ref()).await?;

    let data_sql = format!(
        "SELECT {REMINDER_COLUMNS} FROM reminders WHERE user_id = ?{condition} \
         ORDER BY {} LIMIT ? OFFSET ?",
        order_for(scope)
    );
    let mut data_q = sqlx::query_as::<_, Reminder>(&data_sql).bind(auth.user_id);
    if scope.needs_now() {
        data_q = data_q.bind(now);
    }
    let rows = data_q
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool.get_ref())
        .await?;

    Ok(HttpResponse::Ok().json(Paginated::new(rows, page, total)))
}

#[utoipa::path(
    get,
    path = "/api/reminders/{reminder_id}",
    params(("reminder_id" = u64, Path, description = "Reminder id")),
    responses((status = 200, description = "Reminder", body = Reminder), (status = 404, description = "Reminder not found")),
    security(("bearer_auth" = [])),
    tag = "Reminders"
)]
pub async fn get_reminder(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageReminders)?;
    let reminder = fetch_own(pool.get_ref(), auth.user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(reminder))
}

#[utoipa::path(
    patch,
    path = "/api/reminders/{reminder_id}",
    params(("reminder_id" = u64, Path, description = "Reminder id")),
    request_body(content = Object, example = json!({"due_at": "2026-11-02T09:00:00Z"})),
    responses(
        (status = 200, description = "Updated reminder", body = Reminder),
        (status = 400, description = "Unknown field or invalid value"),
        (status = 404, description = "Reminder not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Reminders"
)]
pub async fn update_reminder(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<Value>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageReminders)?;
    let id = path.into_inner();

    let update = build_update_sql("reminders", &body, REMINDER_UPDATABLE, "id", id)?;
    let rescheduled = match body.as_object() {
        Some(patch) => {
            validate_patch(patch)?;
            patch.contains_key("due_at")
        }
        None => false,
    };

    fetch_own(pool.get_ref(), auth.user_id, id).await?;
    execute_update(pool.get_ref(), update).await?;

    // a new due time earns a new notification
    if rescheduled {
        sqlx::query("UPDATE reminders SET notified_at = NULL WHERE id = ?")
            .bind(id)
            .execute(pool.get_ref())
            .await?;
    }

    let reminder = fetch_own(pool.get_ref(), auth.user_id, id).await?;
    Ok(HttpResponse::Ok().json(reminder))
}

#[utoipa::path(
    put,
    path = "/api/reminders/{reminder_id}/complete",
    params(("reminder_id" = u64, Path, description = "Reminder id")),
    responses((status = 200, description = "Reminder marked done", body = Reminder), (status = 404, description = "Reminder not found")),
    security(("bearer_auth" = [])),
    tag = "Reminders"
)]
pub async fn complete_reminder(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageReminders)?;
    let id = path.into_inner();
    fetch_own(pool.get_ref(), auth.user_id, id).await?;

    sqlx::query("UPDATE reminders SET done = TRUE WHERE id = ?")
        .bind(id)
        .execute(pool.get_ref())
        .await?;

    let reminder = fetch_own(pool.get_ref(), auth.user_id, id).await?;
    Ok(HttpResponse::Ok().json(reminder))
}

#[utoipa::path(
    delete,
    path = "/api/reminders/{reminder_id}",
    params(("reminder_id" = u64, Path, description = "Reminder id")),
    responses((status = 200, description = "Deleted"), (status = 404, description = "Reminder not found")),
    security(("bearer_auth" = [])),
    tag = "Reminders"
)]
pub async fn delete_reminder(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageReminders)?;

    let done = sqlx::query("DELETE FROM reminders WHERE id = ? AND user_id = ?")
        .bind(path.into_inner())
        .bind(auth.user_id)
        .execute(pool.get_ref())
        .await?;

    if done.rows_affected() == 0 {
        return Err(ApiError::not_found("Reminder"));
    }
    Ok(HttpResponse::Ok().json(json!({ "message": "Successfully deleted" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upcoming_reads_soonest_first() {
        assert_eq!(order_for(ReminderScope::Upcoming), "due_at ASC, id ASC");
        assert_eq!(order_for(ReminderScope::Done), "due_at DESC, id DESC");
    }

    #[test]
    fn patch_rejects_blank_title_and_bad_timestamps() {
        let ok = json!({"title": "Call back", "due_at": "2026-11-02T09:00:00Z"});
        assert!(validate_patch(ok.as_object().unwrap()).is_ok());

        let blank = json!({"title": " "});
        assert!(validate_patch(blank.as_object().unwrap()).is_err());

        let date_only = json!({"due_at": "2026-11-02"});
        assert!(validate_patch(date_only.as_object().unwrap()).is_err());
    }

    #[test]
    fn done_flag_is_not_a_plain_update() {
        assert!(build_update_sql("reminders", &json!({"done": true}), REMINDER_UPDATABLE, "id", 1).is_err());
        assert!(build_update_sql("reminders", &json!({"user_id": 2}), REMINDER_UPDATABLE, "id", 1).is_err());
    }
}
