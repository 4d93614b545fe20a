use actix_web::{HttpResponse, web};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Executor, MySql, MySqlPool};
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::{
    auth::auth::AuthUser,
    config::Config,
    error::{ApiError, ApiResult},
    model::{role::Permission, time_entry::TimeEntry},
    timeclock::{
        self, ClockError, MergedEntry, close_session, find_active, merge_entries,
        validate_range, validate_span, work_date_for,
    },
};

const ENTRY_COLUMNS: &str =
    "id, user_id, work_date, clock_in, clock_out, break_started_at, break_seconds, note";

/// Serialises clock-ins of one user until the transaction ends.
const LOCK_USER_SQL: &str = "SELECT id FROM users WHERE id = ? FOR UPDATE";

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ClockInReq {
    #[schema(example = "Front desk")]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RangeQuery {
    /// First day, inclusive (defaults to six days before `to`)
    #[param(value_type = Option<String>, format = "date")]
    pub from: Option<NaiveDate>,
    /// Last day, inclusive (defaults to today)
    #[param(value_type = Option<String>, format = "date")]
    pub to: Option<NaiveDate>,
    /// Another user's entries; needs `view_all_timesheets`
    pub user_id: Option<u64>,
    /// Every user's entries; needs `view_all_timesheets`
    pub all: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EditEntryReq {
    #[schema(value_type = Option<String>, format = "date-time")]
    pub clock_in: Option<DateTime<Utc>>,
    /// `null` reopens the session
    #[schema(value_type = Option<String>, format = "date-time")]
    #[serde(default, deserialize_with = "double_option")]
    pub clock_out: Option<Option<DateTime<Utc>>>,
    pub break_seconds: Option<i64>,
    pub note: Option<String>,
}

/// Distinguish an absent field from an explicit `null`.
fn double_option<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClockStatus {
    pub active: Option<TimeEntry>,
    pub on_break: bool,
    pub today: Option<MergedEntry>,
}

/// Whose entries a range query covers.
#[derive(Debug, PartialEq)]
enum Scope {
    User(u64),
    Everyone,
}

fn resolve_scope(auth: &AuthUser, query: &RangeQuery) -> ApiResult<Scope> {
    if query.all.unwrap_or(false) {
        auth.require(Permission::ViewAllTimesheets)?;
        return Ok(Scope::Everyone);
    }
    match query.user_id {
        Some(id) if id != auth.user_id => {
            auth.require(Permission::ViewAllTimesheets)?;
            Ok(Scope::User(id))
        }
        _ => Ok(Scope::User(auth.user_id)),
    }
}

fn resolve_range(query: &RangeQuery, today: NaiveDate) -> Result<(NaiveDate, NaiveDate), ClockError> {
    let to = query.to.unwrap_or(today);
    let from = query.from.unwrap_or(to - Duration::days(6));
    validate_range(from, to)?;
    Ok((from, to))
}

async fn load_entries<'e, E>(
    executor: E,
    from: NaiveDate,
    to: NaiveDate,
    scope: &Scope,
) -> ApiResult<Vec<TimeEntry>>
where
    E: Executor<'e, Database = MySql>,
{
    let entries = match scope {
        Scope::User(user_id) => {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM time_entries \
                 WHERE user_id = ? AND work_date BETWEEN ? AND ? ORDER BY clock_in"
            );
            sqlx::query_as::<_, TimeEntry>(&sql)
                .bind(user_id)
                .bind(from)
                .bind(to)
                .fetch_all(executor)
                .await?
        }
        Scope::Everyone => {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM time_entries \
                 WHERE work_date BETWEEN ? AND ? ORDER BY clock_in"
            );
            sqlx::query_as::<_, TimeEntry>(&sql)
                .bind(from)
                .bind(to)
                .fetch_all(executor)
                .await?
        }
    };
    Ok(entries)
}

/// Open sessions of a user that may still be active right now.
async fn recent_entries<'e, E>(
    executor: E,
    config: &Config,
    user_id: u64,
    now: DateTime<Utc>,
) -> ApiResult<Vec<TimeEntry>>
where
    E: Executor<'e, Database = MySql>,
{
    let today = work_date_for(now, config.clock_offset());
    load_entries(executor, today - Duration::days(1), today, &Scope::User(user_id)).await
}

async fn active_entry(
    pool: &MySqlPool,
    config: &Config,
    user_id: u64,
    now: DateTime<Utc>,
) -> ApiResult<TimeEntry> {
    let entries = recent_entries(pool, config, user_id, now).await?;
    find_active(&entries, user_id, now, config.clock_offset())
        .cloned()
        .ok_or_else(|| ClockError::NotActive.into())
}

fn ensure_clocked_out(
    recent: &[TimeEntry],
    user_id: u64,
    now: DateTime<Utc>,
    config: &Config,
) -> Result<(), ClockError> {
    match find_active(recent, user_id, now, config.clock_offset()) {
        Some(_) => Err(ClockError::AlreadyActive),
        None => Ok(()),
    }
}

async fn fetch_entry(pool: &MySqlPool, id: u64) -> ApiResult<TimeEntry> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM time_entries WHERE id = ?");
    sqlx::query_as::<_, TimeEntry>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Time entry"))
}

#[utoipa::path(
    post,
    path = "/api/clock/in",
    request_body = ClockInReq,
    responses(
        (status = 201, description = "Clocked in", body = TimeEntry),
        (status = 409, description = "Already clocked in")
    ),
    security(("bearer_auth" = [])),
    tag = "Clock"
)]
pub async fn clock_in(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
    body: Option<web::Json<ClockInReq>>,
) -> ApiResult<HttpResponse> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    sqlx::query(LOCK_USER_SQL)
        .bind(auth.user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ApiError::not_found("User"))?;

    let recent = recent_entries(&mut *tx, &config, auth.user_id, now).await?;
    ensure_clocked_out(&recent, auth.user_id, now, &config)?;

    let note = body
        .and_then(|b| b.into_inner().note)
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    let work_date = work_date_for(now, config.clock_offset());

    let result = sqlx::query(
        r#"
        INSERT INTO time_entries (user_id, work_date, clock_in, note)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(auth.user_id)
    .bind(work_date)
    .bind(now)
    .bind(&note)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(user_id = auth.user_id, %work_date, "Clocked in");

    Ok(HttpResponse::Created().json(TimeEntry {
        id: result.last_insert_id(),
        user_id: auth.user_id,
        work_date,
        clock_in: now,
        clock_out: None,
        break_started_at: None,
        break_seconds: 0,
        note,
    }))
}

#[utoipa::path(
    post,
    path = "/api/clock/out",
    responses(
        (status = 200, description = "Clocked out", body = TimeEntry),
        (status = 400, description = "No active clock-in found")
    ),
    security(("bearer_auth" = [])),
    tag = "Clock"
)]
pub async fn clock_out(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
) -> ApiResult<HttpResponse> {
    let now = Utc::now();
    let mut entry = active_entry(pool.get_ref(), &config, auth.user_id, now).await?;
    let closed = close_session(&entry, now)?;

    let result = sqlx::query(
        r#"
        UPDATE time_entries
        SET clock_out = ?, break_seconds = ?, break_started_at = NULL
        WHERE id = ? AND clock_out IS NULL
        "#,
    )
    .bind(closed.clock_out)
    .bind(closed.break_seconds)
    .bind(entry.id)
    .execute(pool.get_ref())
    .await?;

    if result.rows_affected() == 0 {
        // closed concurrently from another device
        return Err(ClockError::NotActive.into());
    }

    entry.clock_out = Some(closed.clock_out);
    entry.break_seconds = closed.break_seconds;
    entry.break_started_at = None;

    info!(
        user_id = auth.user_id,
        entry_id = entry.id,
        worked_seconds = timeclock::session_worked_seconds(&entry, now),
        "Clocked out"
    );
    Ok(HttpResponse::Ok().json(entry))
}

#[utoipa::path(
    post,
    path = "/api/clock/break/start",
    responses(
        (status = 200, description = "Break started", body = TimeEntry),
        (status = 400, description = "Not clocked in or break already running")
    ),
    security(("bearer_auth" = [])),
    tag = "Clock"
)]
pub async fn start_break(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
) -> ApiResult<HttpResponse> {
    let now = Utc::now();
    let mut entry = active_entry(pool.get_ref(), &config, auth.user_id, now).await?;
    let started = timeclock::start_break(&entry, now)?;

    let result = sqlx::query(
        r#"
        UPDATE time_entries
        SET break_started_at = ?
        WHERE id = ? AND clock_out IS NULL AND break_started_at IS NULL
        "#,
    )
    .bind(started)
    .bind(entry.id)
    .execute(pool.get_ref())
    .await?;

    if result.rows_affected() == 0 {
        return Err(ClockError::AlreadyOnBreak.into());
    }

    entry.break_started_at = Some(started);
    Ok(HttpResponse::Ok().json(entry))
}

#[utoipa::path(
    post,
    path = "/api/clock/break/end",
    responses(
        (status = 200, description = "Break ended", body = TimeEntry),
        (status = 400, description = "Not clocked in or no break running")
    ),
    security(("bearer_auth" = [])),
    tag = "Clock"
)]
pub async fn end_break(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
) -> ApiResult<HttpResponse> {
    let now = Utc::now();
    let mut entry = active_entry(pool.get_ref(), &config, auth.user_id, now).await?;
    let break_seconds = timeclock::end_break(&entry, now)?;

    let result = sqlx::query(
        r#"
        UPDATE time_entries
        SET break_seconds = ?, break_started_at = NULL
        WHERE id = ? AND clock_out IS NULL AND break_started_at IS NOT NULL
        "#,
    )
    .bind(break_seconds)
    .bind(entry.id)
    .execute(pool.get_ref())
    .await?;

    if result.rows_affected() == 0 {
        return Err(ClockError::NotOnBreak.into());
    }

    entry.break_seconds = break_seconds;
    entry.break_started_at = None;
    Ok(HttpResponse::Ok().json(entry))
}

#[utoipa::path(
    get,
    path = "/api/clock/status",
    responses((status = 200, description = "Active session and today's totals", body = ClockStatus)),
    security(("bearer_auth" = [])),
    tag = "Clock"
)]
pub async fn status(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
) -> ApiResult<HttpResponse> {
    let now = Utc::now();
    let offset = config.clock_offset();
    let entries = recent_entries(pool.get_ref(), &config, auth.user_id, now).await?;

    let active = find_active(&entries, auth.user_id, now, offset).cloned();
    let today = work_date_for(now, offset);
    let today_merged = merge_entries(&entries, now)
        .into_iter()
        .find(|m| m.work_date == today);

    Ok(HttpResponse::Ok().json(ClockStatus {
        on_break: active.as_ref().is_some_and(TimeEntry::on_break),
        active,
        today: today_merged,
    }))
}

#[utoipa::path(
    get,
    path = "/api/clock/entries",
    params(RangeQuery),
    responses(
        (status = 200, description = "One merged entry per user and day", body = [MergedEntry]),
        (status = 400, description = "Invalid range"),
        (status = 403, description = "Other users' entries need view_all_timesheets")
    ),
    security(("bearer_auth" = [])),
    tag = "Clock"
)]
pub async fn list_entries(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
    query: web::Query<RangeQuery>,
) -> ApiResult<HttpResponse> {
    let now = Utc::now();
    let scope = resolve_scope(&auth, &query)?;
    let (from, to) = resolve_range(&query, work_date_for(now, config.clock_offset()))?;

    let entries = load_entries(pool.get_ref(), from, to, &scope).await?;
    Ok(HttpResponse::Ok().json(merge_entries(&entries, now)))
}

#[utoipa::path(
    get,
    path = "/api/clock/sessions",
    params(RangeQuery),
    responses((status = 200, description = "Raw clock sessions", body = [TimeEntry])),
    security(("bearer_auth" = [])),
    tag = "Clock"
)]
pub async fn list_sessions(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
    query: web::Query<RangeQuery>,
) -> ApiResult<HttpResponse> {
    let scope = resolve_scope(&auth, &query)?;
    let (from, to) = resolve_range(&query, work_date_for(Utc::now(), config.clock_offset()))?;

    let entries = load_entries(pool.get_ref(), from, to, &scope).await?;
    Ok(HttpResponse::Ok().json(entries))
}

#[utoipa::path(
    get,
    path = "/api/clock/report",
    params(RangeQuery),
    responses(
        (status = 200, description = "Per-user totals over the range", body = [timeclock::UserSummary]),
        (status = 403, description = "Needs view_all_timesheets")
    ),
    security(("bearer_auth" = [])),
    tag = "Clock"
)]
pub async fn report(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
    query: web::Query<RangeQuery>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ViewAllTimesheets)?;

    let now = Utc::now();
    let (from, to) = resolve_range(&query, work_date_for(now, config.clock_offset()))?;
    let scope = match query.user_id {
        Some(id) => Scope::User(id),
        None => Scope::Everyone,
    };

    let entries = load_entries(pool.get_ref(), from, to, &scope).await?;
    let merged = merge_entries(&entries, now);

    Ok(HttpResponse::Ok().json(json!({
        "from": from,
        "to": to,
        "users": timeclock::summarize(&merged),
    })))
}

#[utoipa::path(
    put,
    path = "/api/clock/entries/{entry_id}",
    params(("entry_id" = u64, Path, description = "Time entry id")),
    request_body = EditEntryReq,
    responses(
        (status = 200, description = "Corrected entry", body = TimeEntry),
        (status = 400, description = "Clock-out before clock-in"),
        (status = 403, description = "Admin only"),
        (status = 404, description = "Time entry not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Clock"
)]
pub async fn edit_entry(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
    path: web::Path<u64>,
    body: web::Json<EditEntryReq>,
) -> ApiResult<HttpResponse> {
    auth.require_admin()?;

    let entry_id = path.into_inner();
    let mut entry = fetch_entry(pool.get_ref(), entry_id).await?;
    let body = body.into_inner();

    if let Some(clock_in) = body.clock_in {
        entry.clock_in = clock_in;
        entry.work_date = work_date_for(clock_in, config.clock_offset());
    }
    if let Some(clock_out) = body.clock_out {
        entry.clock_out = clock_out;
    }
    if let Some(break_seconds) = body.break_seconds {
        if break_seconds < 0 {
            return Err(ApiError::bad_request("break_seconds cannot be negative"));
        }
        entry.break_seconds = break_seconds;
    }
    if let Some(note) = body.note {
        entry.note = Some(note).filter(|n| !n.trim().is_empty());
    }
    validate_span(entry.clock_in, entry.clock_out)?;
    if entry.clock_out.is_some() {
        // a closed session cannot keep a running break
        entry.break_started_at = None;
    }

    sqlx::query(
        r#"
        UPDATE time_entries
        SET work_date = ?, clock_in = ?, clock_out = ?, break_started_at = ?,
            break_seconds = ?, note = ?
        WHERE id = ?
        "#,
    )
    .bind(entry.work_date)
    .bind(entry.clock_in)
    .bind(entry.clock_out)
    .bind(entry.break_started_at)
    .bind(entry.break_seconds)
    .bind(&entry.note)
    .bind(entry.id)
    .execute(pool.get_ref())
    .await?;

    warn!(admin_id = auth.user_id, entry_id, user_id = entry.user_id, "Time entry corrected");
    Ok(HttpResponse::Ok().json(entry))
}

#[utoipa::path(
    delete,
    path = "/api/clock/entries/{entry_id}",
    params(("entry_id" = u64, Path, description = "Time entry id")),
    responses(
        (status = 200, description = "Deleted"),
        (status = 403, description = "Admin only"),
        (status = 404, description = "Time entry not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Clock"
)]
pub async fn delete_entry(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    auth.require_admin()?;
    let entry_id = path.into_inner();

    let result = sqlx::query("DELETE FROM time_entries WHERE id = ?")
        .bind(entry_id)
        .execute(pool.get_ref())
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Time entry"));
    }

    warn!(admin_id = auth.user_id, entry_id, "Time entry deleted");
    Ok(HttpResponse::Ok().json(json!({ "message": "Successfully deleted" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::role::Role;

    fn auth(role: Role, perms: &[Permission]) -> AuthUser {
        AuthUser {
            user_id: 5,
            email: "clock@company.com".into(),
            role,
            permissions: perms.iter().copied().collect(),
        }
    }

    fn query(user_id: Option<u64>, all: Option<bool>) -> RangeQuery {
        RangeQuery {
            from: None,
            to: None,
            user_id,
            all,
        }
    }

    #[test]
    fn own_entries_need_no_permission() {
        let staff = auth(Role::Staff, &[]);
        assert_eq!(resolve_scope(&staff, &query(None, None)).unwrap(), Scope::User(5));
        assert_eq!(resolve_scope(&staff, &query(Some(5), None)).unwrap(), Scope::User(5));
    }

    #[test]
    fn other_users_entries_need_permission() {
        let staff = auth(Role::Staff, &[]);
        assert!(resolve_scope(&staff, &query(Some(6), None)).is_err());
        assert!(resolve_scope(&staff, &query(None, Some(true))).is_err());

        let manager = auth(Role::Manager, &[Permission::ViewAllTimesheets]);
        assert_eq!(resolve_scope(&manager, &query(Some(6), None)).unwrap(), Scope::User(6));
        assert_eq!(
            resolve_scope(&manager, &query(None, Some(true))).unwrap(),
            Scope::Everyone
        );
    }

    #[test]
    fn range_defaults_to_last_seven_days() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let (from, to) = resolve_range(&query(None, None), today).unwrap();
        assert_eq!(to, today);
        assert_eq!(from, NaiveDate::from_ymd_opt(2026, 3, 4).unwrap());
    }

    #[test]
    fn explicit_inverted_range_is_rejected() {
        let q = RangeQuery {
            from: NaiveDate::from_ymd_opt(2026, 3, 10),
            to: NaiveDate::from_ymd_opt(2026, 3, 1),
            user_id: None,
            all: None,
        };
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        assert_eq!(resolve_range(&q, today), Err(ClockError::InvertedRange));
    }

    fn open_session(id: u64, work_date: NaiveDate, clock_in: DateTime<Utc>) -> TimeEntry {
        TimeEntry {
            id,
            user_id: 5,
            work_date,
            clock_in,
            clock_out: None,
            break_started_at: None,
            break_seconds: 0,
            note: None,
        }
    }

    #[test]
    fn second_clock_in_is_refused_while_a_session_is_open() {
        let config = Config::for_tests();
        let now = "2026-03-10T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let today = work_date_for(now, config.clock_offset());

        assert_eq!(ensure_clocked_out(&[], 5, now, &config), Ok(()));

        let first = open_session(1, today, now - Duration::seconds(1));
        assert_eq!(
            ensure_clocked_out(&[first], 5, now, &config),
            Err(ClockError::AlreadyActive)
        );

        // an overnight session from yesterday still blocks
        let overnight = open_session(2, today - Duration::days(1), now - Duration::hours(10));
        assert_eq!(
            ensure_clocked_out(&[overnight], 5, now, &config),
            Err(ClockError::AlreadyActive)
        );
    }

    #[test]
    fn clock_in_check_holds_a_row_lock_on_the_user() {
        assert!(LOCK_USER_SQL.starts_with("SELECT id FROM users WHERE id = ?"));
        assert!(LOCK_USER_SQL.ends_with("FOR UPDATE"));
    }

    #[test]
    fn edit_body_distinguishes_null_from_missing_clock_out() {
        let reopen: EditEntryReq = serde_json::from_str(r#"{"clock_out": null}"#).unwrap();
        assert_eq!(reopen.clock_out, Some(None));

        let untouched: EditEntryReq = serde_json::from_str(r#"{"note": "fixed"}"#).unwrap();
        assert_eq!(untouched.clock_out, None);
    }
}
