use actix_web::{HttpRequest, HttpResponse, web};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sqlx::MySqlPool;
use strum::IntoEnumIterator;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::{
    api::{
        attachments::{self, UploadQuery},
        notifications::notify,
    },
    auth::auth::AuthUser,
    config::Config,
    error::{ApiError, ApiResult},
    model::{
        attachment::OwnerKind,
        lead::{Lead, LeadCategory, LeadPriority, LeadStatus},
        notification::NotificationKind,
        role::Permission,
    },
    storage::LocalStore,
    timeclock::work_date_for,
    utils::{
        db_utils::{build_update_sql, execute_update},
        pagination::{Filter, FilterValue, Page, Paginated, bind_filters},
    },
};

const LEAD_COLUMNS: &str = "id, category, name, company, email, phone, source, status, priority, \
     assigned_to, next_follow_up, notes, created_by, created_at, updated_at";

/// Columns a partial update may touch. Assignment goes through `assign`.
const LEAD_UPDATABLE: &[&str] = &[
    "category",
    "name",
    "company",
    "email",
    "phone",
    "source",
    "status",
    "priority",
    "next_follow_up",
    "notes",
];

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateLeadReq {
    pub category: Option<LeadCategory>,
    #[schema(example = "Dana Whitfield")]
    pub name: String,
    pub company: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: Option<String>,
    pub status: Option<LeadStatus>,
    pub priority: Option<LeadPriority>,
    pub assigned_to: Option<u64>,
    #[schema(value_type = Option<String>, format = "date")]
    pub next_follow_up: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LeadSort {
    #[default]
    Created,
    Updated,
    Priority,
    FollowUp,
}

impl LeadSort {
    fn order_by(self) -> &'static str {
        match self {
            LeadSort::Created => "created_at DESC, id DESC",
            LeadSort::Updated => "updated_at DESC, id DESC",
            LeadSort::Priority => "FIELD(priority, 'high', 'medium', 'low'), created_at DESC, id DESC",
            // leads without a follow-up date go last
            LeadSort::FollowUp => "next_follow_up IS NULL, next_follow_up ASC, id ASC",
        }
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct LeadQuery {
    pub category: Option<LeadCategory>,
    pub status: Option<LeadStatus>,
    pub priority: Option<LeadPriority>,
    pub assigned_to: Option<u64>,
    /// Matches name, company, email and phone
    pub search: Option<String>,
    /// Open leads whose follow-up date is today or earlier
    pub follow_up_due: Option<bool>,
    #[param(value_type = Option<String>, example = "priority")]
    pub sort: Option<LeadSort>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LeadStatusReq {
    pub status: LeadStatus,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LeadPriorityReq {
    pub priority: LeadPriority,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssignReq {
    /// `null` clears the assignment
    pub user_id: Option<u64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct StatsQuery {
    pub category: Option<LeadCategory>,
}

fn lead_filter(query: &LeadQuery, today: NaiveDate) -> Filter {
    let mut filter = Filter::default();

    if let Some(category) = query.category {
        filter.push("category = ?", FilterValue::Str(category.to_string()));
    }
    if let Some(status) = query.status {
        filter.push("status = ?", FilterValue::Str(status.to_string()));
    }
    if let Some(priority) = query.priority {
        filter.push("priority = ?", FilterValue::Str(priority.to_string()));
    }
    if let Some(user_id) = query.assigned_to {
        filter.push("assigned_to = ?", FilterValue::U64(user_id));
    }
    if let Some(term) = query.search.as_deref() {
        filter.search(&["name", "company", "email", "phone"], term);
    }
    if query.follow_up_due.unwrap_or(false) {
        filter.push("next_follow_up <= ?", FilterValue::Date(today));
        filter.raw("status NOT IN ('won', 'lost')");
    }

    filter
}

/// Reject enum values the lead columns do not accept and blank names.
fn validate_patch(patch: &Map<String, Value>) -> ApiResult<()> {
    fn check<T: std::str::FromStr>(patch: &Map<String, Value>, key: &str) -> ApiResult<()> {
        match patch.get(key) {
            None => Ok(()),
            Some(Value::String(s)) if s.parse::<T>().is_ok() => Ok(()),
            Some(other) => Err(ApiError::bad_request(format!("Invalid {key}: {other}"))),
        }
    }

    check::<LeadCategory>(patch, "category")?;
    check::<LeadStatus>(patch, "status")?;
    check::<LeadPriority>(patch, "priority")?;

    if let Some(name) = patch.get("name") {
        if !matches!(name.as_str(), Some(s) if !s.trim().is_empty()) {
            return Err(ApiError::bad_request("Name must not be empty"));
        }
    }
    Ok(())
}

/// Counts keyed by every variant, zero when absent from the rows.
fn tally<E>(rows: &[(String, i64)]) -> Map<String, Value>
where
    E: IntoEnumIterator + AsRef<str>,
{
    E::iter()
        .map(|variant| {
            let key = variant.as_ref().to_string();
            let count = rows
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, c)| *c)
                .unwrap_or(0);
            (key, json!(count))
        })
        .collect()
}

async fn fetch_lead(pool: &MySqlPool, id: u64) -> ApiResult<Lead> {
    let sql = format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?");
    sqlx::query_as::<_, Lead>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Lead"))
}

async fn ensure_active_user(pool: &MySqlPool, user_id: u64) -> ApiResult<()> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM users WHERE id = ? AND is_active = TRUE",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    if count == 0 {
        return Err(ApiError::bad_request("Assignee must be an active user"));
    }
    Ok(())
}

async fn notify_assignee(pool: &MySqlPool, lead: &Lead, assignee: u64) -> ApiResult<()> {
    let title = format!("Lead assigned: {}", lead.name);
    let link = format!("/leads/{}", lead.id);
    notify(
        pool,
        assignee,
        NotificationKind::Assignment,
        &title,
        lead.company.as_deref(),
        Some(&link),
    )
    .await?;
    Ok(())
}

#[utoipa::path(
    post,
    path = "/api/leads",
    request_body = CreateLeadReq,
    responses(
        (status = 201, description = "Lead created", body = Lead),
        (status = 400, description = "Invalid input"),
        (status = 403, description = "Needs edit_leads")
    ),
    security(("bearer_auth" = [])),
    tag = "Leads"
)]
pub async fn create_lead(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    body: web::Json<CreateLeadReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::EditLeads)?;

    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("Name must not be empty"));
    }
    if let Some(assignee) = body.assigned_to {
        ensure_active_user(pool.get_ref(), assignee).await?;
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO leads
            (category, name, company, email, phone, source, status, priority,
             assigned_to, next_follow_up, notes, created_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(body.category.unwrap_or(LeadCategory::Business).as_ref())
    .bind(name)
    .bind(&body.company)
    .bind(&body.email)
    .bind(&body.phone)
    .bind(&body.source)
    .bind(body.status.unwrap_or(LeadStatus::New).as_ref())
    .bind(body.priority.unwrap_or(LeadPriority::Medium).as_ref())
    .bind(body.assigned_to)
    .bind(body.next_follow_up)
    .bind(&body.notes)
    .bind(auth.user_id)
    .execute(pool.get_ref())
    .await?;

    let lead = fetch_lead(pool.get_ref(), inserted.last_insert_id()).await?;

    if let Some(assignee) = lead.assigned_to.filter(|id| *id != auth.user_id) {
        notify_assignee(pool.get_ref(), &lead, assignee).await?;
    }

    info!(lead_id = lead.id, created_by = auth.user_id, "Lead created");
    Ok(HttpResponse::Created().json(lead))
}

#[utoipa::path(
    get,
    path = "/api/leads",
    params(LeadQuery),
    responses((status = 200, description = "Paginated leads", body = [Lead])),
    security(("bearer_auth" = [])),
    tag = "Leads"
)]
pub async fn list_leads(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
    query: web::Query<LeadQuery>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ViewLeads)?;

    let page = Page::new(query.page, query.per_page);
    let today = work_date_for(Utc::now(), config.clock_offset());
    let filter = lead_filter(&query, today);
    let where_sql = filter.where_clause();

    let count_sql = format!("SELECT COUNT(*) FROM leads{where_sql}");
    let total = bind_filters!(sqlx::query_scalar::<_, i64>(&count_sql), filter.args)
        .fetch_one(pool.get_ref())
        .await?;

    let data_sql = format!(
        "SELECT {LEAD_COLUMNS} FROM leads{where_sql} ORDER BY {} LIMIT ? OFFSET ?",
        query.sort.unwrap_or_default().order_by()
    );
    let rows = bind_filters!(sqlx::query_as::<_, Lead>(&data_sql), filter.args)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool.get_ref())
        .await?;

    Ok(HttpResponse::Ok().json(Paginated::new(rows, page, total)))
}

#[utoipa::path(
    get,
    path = "/api/leads/{lead_id}",
    params(("lead_id" = u64, Path, description = "Lead id")),
    responses((status = 200, description = "Lead", body = Lead), (status = 404, description = "Lead not found")),
    security(("bearer_auth" = [])),
    tag = "Leads"
)]
pub async fn get_lead(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ViewLeads)?;
    let lead = fetch_lead(pool.get_ref(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(lead))
}

#[utoipa::path(
    patch,
    path = "/api/leads/{lead_id}",
    params(("lead_id" = u64, Path, description = "Lead id")),
    request_body(content = Object, example = json!({"status": "qualified", "next_follow_up": "2026-11-02"})),
    responses(
        (status = 200, description = "Updated lead", body = Lead),
        (status = 400, description = "Unknown field or invalid value"),
        (status = 404, description = "Lead not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Leads"
)]
pub async fn update_lead(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<Value>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::EditLeads)?;
    let id = path.into_inner();

    let update = build_update_sql("leads", &body, LEAD_UPDATABLE, "id", id)?;
    if let Some(patch) = body.as_object() {
        validate_patch(patch)?;
    }

    fetch_lead(pool.get_ref(), id).await?;
    execute_update(pool.get_ref(), update).await?;

    let lead = fetch_lead(pool.get_ref(), id).await?;
    Ok(HttpResponse::Ok().json(lead))
}

#[utoipa::path(
    put,
    path = "/api/leads/{lead_id}/status",
    params(("lead_id" = u64, Path, description = "Lead id")),
    request_body = LeadStatusReq,
    responses((status = 200, description = "Updated lead", body = Lead), (status = 404, description = "Lead not found")),
    security(("bearer_auth" = [])),
    tag = "Leads"
)]
pub async fn set_status(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<LeadStatusReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::EditLeads)?;
    let id = path.into_inner();
    fetch_lead(pool.get_ref(), id).await?;

    sqlx::query("UPDATE leads SET status = ? WHERE id = ?")
        .bind(body.status.as_ref())
        .bind(id)
        .execute(pool.get_ref())
        .await?;

    let lead = fetch_lead(pool.get_ref(), id).await?;
    Ok(HttpResponse::Ok().json(lead))
}

#[utoipa::path(
    put,
    path = "/api/leads/{lead_id}/priority",
    params(("lead_id" = u64, Path, description = "Lead id")),
    request_body = LeadPriorityReq,
    responses((status = 200, description = "Updated lead", body = Lead), (status = 404, description = "Lead not found")),
    security(("bearer_auth" = [])),
    tag = "Leads"
)]
pub async fn set_priority(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<LeadPriorityReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::EditLeads)?;
    let id = path.into_inner();
    fetch_lead(pool.get_ref(), id).await?;

    sqlx::query("UPDATE leads SET priority = ? WHERE id = ?")
        .bind(body.priority.as_ref())
        .bind(id)
        .execute(pool.get_ref())
        .await?;

    let lead = fetch_lead(pool.get_ref(), id).await?;
    Ok(HttpResponse::Ok().json(lead))
}

#[utoipa::path(
    put,
    path = "/api/leads/{lead_id}/assign",
    params(("lead_id" = u64, Path, description = "Lead id")),
    request_body = AssignReq,
    responses(
        (status = 200, description = "Updated lead", body = Lead),
        (status = 400, description = "Assignee is not an active user"),
        (status = 404, description = "Lead not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Leads"
)]
pub async fn assign(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<AssignReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::EditLeads)?;
    let id = path.into_inner();
    let before = fetch_lead(pool.get_ref(), id).await?;

    if let Some(assignee) = body.user_id {
        ensure_active_user(pool.get_ref(), assignee).await?;
    }

    sqlx::query("UPDATE leads SET assigned_to = ? WHERE id = ?")
        .bind(body.user_id)
        .bind(id)
        .execute(pool.get_ref())
        .await?;

    let lead = fetch_lead(pool.get_ref(), id).await?;

    // only a change of hands is worth a notification
    let handed_over = body
        .user_id
        .filter(|id| before.assigned_to != Some(*id) && *id != auth.user_id);
    if let Some(assignee) = handed_over {
        notify_assignee(pool.get_ref(), &lead, assignee).await?;
    }

    info!(lead_id = id, assignee = ?body.user_id, by = auth.user_id, "Lead assigned");
    Ok(HttpResponse::Ok().json(lead))
}

#[utoipa::path(
    get,
    path = "/api/leads/stats",
    params(StatsQuery),
    responses((status = 200, description = "Counts by status and priority", body = Object,
        example = json!({"total": 5, "by_status": {"new": 2, "won": 3}, "by_priority": {"high": 1}}))),
    security(("bearer_auth" = [])),
    tag = "Leads"
)]
pub async fn lead_stats(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<StatsQuery>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ViewLeads)?;

    let category = query.category.map(|c| c.to_string());
    let (where_sql, binds): (&str, Vec<String>) = match category {
        Some(c) => (" WHERE category = ?", vec![c]),
        None => ("", Vec::new()),
    };

    let mut by = Vec::with_capacity(2);
    for column in ["status", "priority"] {
        let sql = format!("SELECT {column}, COUNT(*) FROM leads{where_sql} GROUP BY {column}");
        let mut q = sqlx::query_as::<_, (String, i64)>(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        by.push(q.fetch_all(pool.get_ref()).await?);
    }

    let total: i64 = by[0].iter().map(|(_, c)| c).sum();

    Ok(HttpResponse::Ok().json(json!({
        "total": total,
        "by_status": tally::<LeadStatus>(&by[0]),
        "by_priority": tally::<LeadPriority>(&by[1]),
    })))
}

#[utoipa::path(
    delete,
    path = "/api/leads/{lead_id}",
    params(("lead_id" = u64, Path, description = "Lead id")),
    responses((status = 200, description = "Deleted"), (status = 404, description = "Lead not found")),
    security(("bearer_auth" = [])),
    tag = "Leads"
)]
pub async fn delete_lead(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    store: web::Data<LocalStore>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::EditLeads)?;
    let id = path.into_inner();
    fetch_lead(pool.get_ref(), id).await?;

    let mut tx = pool.begin().await?;
    let keys = attachments::detach_owner(&mut tx, OwnerKind::Lead, id).await?;
    sqlx::query("UPDATE candidates SET lead_id = NULL WHERE lead_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE reminders SET lead_id = NULL WHERE lead_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM leads WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    attachments::remove_files(store.get_ref(), &keys).await;

    info!(lead_id = id, by = auth.user_id, "Lead deleted");
    Ok(HttpResponse::Ok().json(json!({ "message": "Successfully deleted" })))
}

#[utoipa::path(
    post,
    path = "/api/leads/{lead_id}/attachments",
    params(("lead_id" = u64, Path, description = "Lead id"), UploadQuery),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "Attachment stored"),
        (status = 404, description = "Lead not found"),
        (status = 413, description = "File too large")
    ),
    security(("bearer_auth" = [])),
    tag = "Leads"
)]
#[allow(clippy::too_many_arguments)]
pub async fn upload_attachment(
    auth: AuthUser,
    req: HttpRequest,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
    store: web::Data<LocalStore>,
    path: web::Path<u64>,
    query: web::Query<UploadQuery>,
    body: web::Bytes,
) -> ApiResult<HttpResponse> {
    attachments::upload(
        OwnerKind::Lead,
        path.into_inner(),
        &auth,
        &req,
        pool.get_ref(),
        config.get_ref(),
        store.get_ref(),
        &query.filename,
        body,
    )
    .await
}

#[utoipa::path(
    get,
    path = "/api/leads/{lead_id}/attachments",
    params(("lead_id" = u64, Path, description = "Lead id")),
    responses((status = 200, description = "Attachments, newest first", body = [crate::model::attachment::Attachment])),
    security(("bearer_auth" = [])),
    tag = "Leads"
)]
pub async fn list_attachments(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    attachments::list(OwnerKind::Lead, path.into_inner(), &auth, pool.get_ref()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    #[test]
    fn empty_query_lists_everything() {
        let filter = lead_filter(&LeadQuery::default(), today());
        assert_eq!(filter.where_clause(), "");
    }

    #[test]
    fn follow_up_due_excludes_closed_leads() {
        let query = LeadQuery {
            status: Some(LeadStatus::Contacted),
            follow_up_due: Some(true),
            ..Default::default()
        };
        let filter = lead_filter(&query, today());

        assert_eq!(
            filter.where_clause(),
            " WHERE status = ? AND next_follow_up <= ? AND status NOT IN ('won', 'lost')"
        );
        assert!(matches!(filter.args[1], FilterValue::Date(d) if d == today()));
    }

    #[test]
    fn enum_filters_bind_lowercase_names() {
        let query = LeadQuery {
            category: Some(LeadCategory::Recruitment),
            priority: Some(LeadPriority::High),
            ..Default::default()
        };
        let filter = lead_filter(&query, today());
        match (&filter.args[0], &filter.args[1]) {
            (FilterValue::Str(c), FilterValue::Str(p)) => {
                assert_eq!(c, "recruitment");
                assert_eq!(p, "high");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn priority_sort_puts_high_first() {
        assert!(LeadSort::Priority.order_by().starts_with("FIELD(priority, 'high'"));
        let sort: LeadSort = serde_json::from_str("\"follow_up\"").unwrap();
        assert_eq!(sort, LeadSort::FollowUp);
    }

    #[test]
    fn patch_validation_checks_enum_columns() {
        let ok = json!({"status": "won", "priority": "low", "category": "business"});
        assert!(validate_patch(ok.as_object().unwrap()).is_ok());

        let bad_status = json!({"status": "archived"});
        assert!(validate_patch(bad_status.as_object().unwrap()).is_err());

        let bad_type = json!({"priority": 3});
        assert!(validate_patch(bad_type.as_object().unwrap()).is_err());

        let blank_name = json!({"name": "  "});
        assert!(validate_patch(blank_name.as_object().unwrap()).is_err());
    }

    #[test]
    fn assignment_is_not_a_plain_update() {
        let err = build_update_sql("leads", &json!({"assigned_to": 4}), LEAD_UPDATABLE, "id", 1)
            .unwrap_err();
        assert!(err.to_string().contains("assigned_to"));
    }

    #[test]
    fn tally_fills_missing_variants_with_zero() {
        let rows = vec![("won".to_string(), 3), ("new".to_string(), 2)];
        let counts = tally::<LeadStatus>(&rows);

        assert_eq!(counts.len(), LeadStatus::iter().count());
        assert_eq!(counts["won"], json!(3));
        assert_eq!(counts["new"], json!(2));
        assert_eq!(counts["lost"], json!(0));
    }
}
