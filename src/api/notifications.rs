use actix_web::{HttpResponse, web};
use serde::Deserialize;
use serde_json::json;
use sqlx::{Executor, MySql, MySqlPool};
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::{
    auth::auth::AuthUser,
    error::{ApiError, ApiResult},
    model::{
        notification::{Notification, NotificationKind},
        role::{Permission, Role},
    },
    utils::pagination::{Filter, FilterValue, Page, Paginated, bind_filters},
};

const NOTIFICATION_COLUMNS: &str = "id, user_id, kind, title, body, link, is_read, created_at";

#[derive(Debug, Deserialize, IntoParams)]
pub struct NotificationQuery {
    /// Only unread notifications
    pub unread_only: Option<bool>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BroadcastReq {
    #[schema(example = "Office closed Friday")]
    pub title: String,
    pub body: Option<String>,
    pub link: Option<String>,
    /// Limit to one role; everyone active when absent
    pub role: Option<Role>,
}

/// Insert one notification. Works on a pool or inside a transaction.
pub async fn notify<'e, E>(
    executor: E,
    user_id: u64,
    kind: NotificationKind,
    title: &str,
    body: Option<&str>,
    link: Option<&str>,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = MySql>,
{
    let done = sqlx::query(
        r#"
        INSERT INTO notifications (user_id, kind, title, body, link)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(kind.as_ref())
    .bind(title)
    .bind(body)
    .bind(link)
    .execute(executor)
    .await?;

    Ok(done.last_insert_id())
}

#[utoipa::path(
    get,
    path = "/api/notifications",
    params(NotificationQuery),
    responses((status = 200, description = "Paginated notifications, newest first", body = [Notification])),
    security(("bearer_auth" = [])),
    tag = "Notifications"
)]
pub async fn list_notifications(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<NotificationQuery>,
) -> ApiResult<HttpResponse> {
    let page = Page::new(query.page, query.per_page);

    let mut filter = Filter::default();
    filter.push("user_id = ?", FilterValue::U64(auth.user_id));
    if query.unread_only.unwrap_or(false) {
        filter.raw("is_read = FALSE");
    }
    let where_sql = filter.where_clause();

    let count_sql = format!("SELECT COUNT(*) FROM notifications{where_sql}");
    let total = bind_filters!(sqlx::query_scalar::<_, i64>(&count_sql), filter.args)
        .fetch_one(pool.get_ref())
        .await?;

    let data_sql = format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM notifications{where_sql} \
         ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
    );
    let rows = bind_filters!(sqlx::query_as::<_, Notification>(&data_sql), filter.args)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool.get_ref())
        .await?;

    Ok(HttpResponse::Ok().json(Paginated::new(rows, page, total)))
}

#[utoipa::path(
    get,
    path = "/api/notifications/unread-count",
    responses((status = 200, description = "Unread count", body = Object, example = json!({"unread": 3}))),
    security(("bearer_auth" = [])),
    tag = "Notifications"
)]
pub async fn unread_count(auth: AuthUser, pool: web::Data<MySqlPool>) -> ApiResult<HttpResponse> {
    let unread = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_read = FALSE",
    )
    .bind(auth.user_id)
    .fetch_one(pool.get_ref())
    .await?;

    Ok(HttpResponse::Ok().json(json!({ "unread": unread })))
}

async fn set_read(pool: &MySqlPool, user_id: u64, id: u64, read: bool) -> ApiResult<()> {
    let exists = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM notifications WHERE id = ? AND user_id = ?",
    )
    .bind(id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    if exists == 0 {
        return Err(ApiError::not_found("Notification"));
    }

    sqlx::query("UPDATE notifications SET is_read = ? WHERE id = ? AND user_id = ?")
        .bind(read)
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[utoipa::path(
    put,
    path = "/api/notifications/{notification_id}/read",
    params(("notification_id" = u64, Path, description = "Notification id")),
    responses((status = 200, description = "Marked read"), (status = 404, description = "Notification not found")),
    security(("bearer_auth" = [])),
    tag = "Notifications"
)]
pub async fn mark_read(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    set_read(pool.get_ref(), auth.user_id, path.into_inner(), true).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Marked read" })))
}

#[utoipa::path(
    put,
    path = "/api/notifications/{notification_id}/unread",
    params(("notification_id" = u64, Path, description = "Notification id")),
    responses((status = 200, description = "Marked unread"), (status = 404, description = "Notification not found")),
    security(("bearer_auth" = [])),
    tag = "Notifications"
)]
pub async fn mark_unread(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    set_read(pool.get_ref(), auth.user_id, path.into_inner(), false).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Marked unread" })))
}

#[utoipa::path(
    put,
    path = "/api/notifications/read-all",
    responses((status = 200, description = "All marked read", body = Object, example = json!({"updated": 4}))),
    security(("bearer_auth" = [])),
    tag = "Notifications"
)]
pub async fn mark_all_read(auth: AuthUser, pool: web::Data<MySqlPool>) -> ApiResult<HttpResponse> {
    let done = sqlx::query(
        "UPDATE notifications SET is_read = TRUE WHERE user_id = ? AND is_read = FALSE",
    )
    .bind(auth.user_id)
    .execute(pool.get_ref())
    .await?;

    Ok(HttpResponse::Ok().json(json!({ "updated": done.rows_affected() })))
}

#[utoipa::path(
    delete,
    path = "/api/notifications/{notification_id}",
    params(("notification_id" = u64, Path, description = "Notification id")),
    responses((status = 200, description = "Deleted"), (status = 404, description = "Notification not found")),
    security(("bearer_auth" = [])),
    tag = "Notifications"
)]
pub async fn delete_notification(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    let done = sqlx::query("DELETE FROM notifications WHERE id = ? AND user_id = ?")
        .bind(path.into_inner())
        .bind(auth.user_id)
        .execute(pool.get_ref())
        .await?;

    if done.rows_affected() == 0 {
        return Err(ApiError::not_found("Notification"));
    }
    Ok(HttpResponse::Ok().json(json!({ "message": "Successfully deleted" })))
}

#[utoipa::path(
    post,
    path = "/api/notifications/broadcast",
    request_body = BroadcastReq,
    responses(
        (status = 201, description = "Notifications created", body = Object, example = json!({"recipients": 12})),
        (status = 403, description = "Needs manage_users")
    ),
    security(("bearer_auth" = [])),
    tag = "Notifications"
)]
pub async fn broadcast(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    body: web::Json<BroadcastReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageUsers)?;

    let title = body.title.trim();
    if title.is_empty() {
        return Err(ApiError::bad_request("Title must not be empty"));
    }

    let recipients = match body.role {
        Some(role) => {
            sqlx::query_scalar::<_, u64>("SELECT id FROM users WHERE is_active = TRUE AND role_id = ?")
                .bind(role.id())
                .fetch_all(pool.get_ref())
                .await?
        }
        None => {
            sqlx::query_scalar::<_, u64>("SELECT id FROM users WHERE is_active = TRUE")
                .fetch_all(pool.get_ref())
                .await?
        }
    };

    let mut tx = pool.begin().await?;
    for user_id in &recipients {
        notify(
            &mut *tx,
            *user_id,
            NotificationKind::System,
            title,
            body.body.as_deref(),
            body.link.as_deref(),
        )
        .await?;
    }
    tx.commit().await?;

    info!(sender = auth.user_id, recipients = recipients.len(), "Broadcast sent");
    Ok(HttpResponse::Created().json(json!({ "recipients": recipients.len() })))
}
