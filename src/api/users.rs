use actix_web::{HttpResponse, web};
use serde::Deserialize;
use serde_json::json;
use sqlx::MySqlPool;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::{
    auth::{
        auth::AuthUser,
        handlers::{USER_COLUMNS, fetch_user, hash, validate_password},
    },
    error::{ApiError, ApiResult},
    model::{
        role::{Permission, PermissionSet, Role, format_permissions},
        user::{User, UserProfile},
    },
    utils::{
        email_cache, email_filter,
        pagination::{Filter, FilterValue, Page, Paginated, bind_filters},
    },
};

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct UserQuery {
    #[param(value_type = Option<String>, example = "manager")]
    pub role: Option<Role>,
    pub active: Option<bool>,
    /// Matches email and full name
    pub search: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetRoleReq {
    pub role: Role,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetActiveReq {
    pub active: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetPermissionsReq {
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResetPasswordReq {
    pub new_password: String,
}

fn user_filter(query: &UserQuery) -> Filter {
    let mut filter = Filter::default();
    if let Some(role) = query.role {
        filter.push("role_id = ?", FilterValue::U64(role.id() as u64));
    }
    if let Some(active) = query.active {
        filter.push("is_active = ?", FilterValue::Bool(active));
    }
    if let Some(term) = query.search.as_deref() {
        filter.search(&["email", "full_name"], term);
    }
    filter
}

/// The last active admin can neither lose the role nor be switched off.
fn keeps_an_admin(target: &User, stays_admin: bool, active_admins: i64) -> ApiResult<()> {
    let is_active_admin = target.is_active && target.role() == Some(Role::Admin);
    if is_active_admin && !stays_admin && active_admins <= 1 {
        return Err(ApiError::conflict("Cannot remove the last active admin"));
    }
    Ok(())
}

fn not_self(auth: &AuthUser, target_id: u64, action: &str) -> ApiResult<()> {
    if auth.user_id == target_id {
        return Err(ApiError::bad_request(format!("You cannot {action} yourself")));
    }
    Ok(())
}

/// Flip one permission; returns whether it is now granted.
fn toggle(set: &mut PermissionSet, permission: Permission) -> bool {
    if set.remove(&permission) {
        false
    } else {
        set.insert(permission);
        true
    }
}

async fn load_user(pool: &MySqlPool, id: u64) -> ApiResult<User> {
    fetch_user(pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found("User"))
}

async fn active_admins(pool: &MySqlPool) -> ApiResult<i64> {
    Ok(sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM users WHERE role_id = ? AND is_active = TRUE",
    )
    .bind(Role::Admin.id())
    .fetch_one(pool)
    .await?)
}

async fn revoke_refresh_tokens(pool: &MySqlPool, user_id: u64) -> ApiResult<()> {
    sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = ? AND revoked = FALSE")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn store_permissions(pool: &MySqlPool, id: u64, set: &PermissionSet) -> ApiResult<()> {
    sqlx::query("UPDATE users SET permissions = ? WHERE id = ?")
        .bind(format_permissions(set))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn profile(pool: &MySqlPool, id: u64) -> ApiResult<HttpResponse> {
    let user = load_user(pool, id).await?;
    Ok(HttpResponse::Ok().json(UserProfile::from(user)))
}

#[utoipa::path(
    get,
    path = "/api/users",
    params(UserQuery),
    responses((status = 200, description = "Paginated users", body = [UserProfile]), (status = 403, description = "Needs manage_users")),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn list_users(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<UserQuery>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageUsers)?;

    let page = Page::new(query.page, query.per_page);
    let filter = user_filter(&query);
    let where_sql = filter.where_clause();

    let count_sql = format!("SELECT COUNT(*) FROM users{where_sql}");
    let total = bind_filters!(sqlx::query_scalar::<_, i64>(&count_sql), filter.args)
        .fetch_one(pool.get_ref())
        .await?;

    let data_sql =
        format!("SELECT {USER_COLUMNS} FROM users{where_sql} ORDER BY id LIMIT ? OFFSET ?");
    let users = bind_filters!(sqlx::query_as::<_, User>(&data_sql), filter.args)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool.get_ref())
        .await?;

    let profiles: Vec<UserProfile> = users.into_iter().map(UserProfile::from).collect();
    Ok(HttpResponse::Ok().json(Paginated::new(profiles, page, total)))
}

#[utoipa::path(
    get,
    path = "/api/users/{user_id}",
    params(("user_id" = u64, Path, description = "User id")),
    responses((status = 200, description = "User", body = UserProfile), (status = 404, description = "User not found")),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn get_user(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageUsers)?;
    profile(pool.get_ref(), path.into_inner()).await
}

/// Change the role; permissions reset to the new role's defaults.
#[utoipa::path(
    put,
    path = "/api/users/{user_id}/role",
    params(("user_id" = u64, Path, description = "User id")),
    request_body = SetRoleReq,
    responses(
        (status = 200, description = "Updated user", body = UserProfile),
        (status = 404, description = "User not found"),
        (status = 409, description = "Last active admin")
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn set_role(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<SetRoleReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageUsers)?;
    let id = path.into_inner();
    let target = load_user(pool.get_ref(), id).await?;

    keeps_an_admin(&target, body.role == Role::Admin, active_admins(pool.get_ref()).await?)?;

    sqlx::query("UPDATE users SET role_id = ?, permissions = ? WHERE id = ?")
        .bind(body.role.id())
        .bind(format_permissions(&body.role.default_permissions()))
        .bind(id)
        .execute(pool.get_ref())
        .await?;

    info!(user_id = id, role = %body.role, by = auth.user_id, "Role changed");
    profile(pool.get_ref(), id).await
}

#[utoipa::path(
    put,
    path = "/api/users/{user_id}/active",
    params(("user_id" = u64, Path, description = "User id")),
    request_body = SetActiveReq,
    responses(
        (status = 200, description = "Updated user", body = UserProfile),
        (status = 400, description = "Cannot deactivate yourself"),
        (status = 409, description = "Last active admin")
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn set_active(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<SetActiveReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageUsers)?;
    let id = path.into_inner();
    if !body.active {
        not_self(&auth, id, "deactivate")?;
    }
    let target = load_user(pool.get_ref(), id).await?;
    if !body.active {
        keeps_an_admin(&target, false, active_admins(pool.get_ref()).await?)?;
    }

    sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
        .bind(body.active)
        .bind(id)
        .execute(pool.get_ref())
        .await?;

    if !body.active {
        revoke_refresh_tokens(pool.get_ref(), id).await?;
        warn!(user_id = id, by = auth.user_id, "User deactivated");
    }
    profile(pool.get_ref(), id).await
}

#[utoipa::path(
    put,
    path = "/api/users/{user_id}/permissions",
    params(("user_id" = u64, Path, description = "User id")),
    request_body = SetPermissionsReq,
    responses((status = 200, description = "Updated user", body = UserProfile), (status = 404, description = "User not found")),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn set_permissions(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<SetPermissionsReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageUsers)?;
    let id = path.into_inner();
    load_user(pool.get_ref(), id).await?;

    let set: PermissionSet = body.permissions.iter().copied().collect();
    store_permissions(pool.get_ref(), id, &set).await?;

    info!(user_id = id, permissions = %format_permissions(&set), by = auth.user_id, "Permissions replaced");
    profile(pool.get_ref(), id).await
}

#[utoipa::path(
    put,
    path = "/api/users/{user_id}/permissions/{permission}",
    params(
        ("user_id" = u64, Path, description = "User id"),
        ("permission" = Permission, Path, description = "Permission to flip")
    ),
    responses((status = 200, description = "Updated user", body = UserProfile), (status = 404, description = "User not found")),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn toggle_permission(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<(u64, Permission)>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageUsers)?;
    let (id, permission) = path.into_inner();
    let target = load_user(pool.get_ref(), id).await?;

    let mut set = target.permission_set();
    let granted = toggle(&mut set, permission);
    store_permissions(pool.get_ref(), id, &set).await?;

    info!(user_id = id, %permission, granted, by = auth.user_id, "Permission toggled");
    profile(pool.get_ref(), id).await
}

#[utoipa::path(
    put,
    path = "/api/users/{user_id}/password",
    params(("user_id" = u64, Path, description = "User id")),
    request_body = ResetPasswordReq,
    responses((status = 200, description = "Password reset"), (status = 400, description = "Password too short")),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn reset_password(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<ResetPasswordReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageUsers)?;
    let id = path.into_inner();
    validate_password(&body.new_password)?;
    load_user(pool.get_ref(), id).await?;

    sqlx::query("UPDATE users SET password = ? WHERE id = ?")
        .bind(hash(&body.new_password)?)
        .bind(id)
        .execute(pool.get_ref())
        .await?;
    revoke_refresh_tokens(pool.get_ref(), id).await?;

    info!(user_id = id, by = auth.user_id, "Password reset");
    Ok(HttpResponse::Ok().json(json!({ "message": "Password reset" })))
}

#[utoipa::path(
    delete,
    path = "/api/users/{user_id}",
    params(("user_id" = u64, Path, description = "User id")),
    responses(
        (status = 200, description = "Deleted"),
        (status = 400, description = "Cannot delete yourself"),
        (status = 404, description = "User not found"),
        (status = 409, description = "Last active admin")
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn delete_user(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageUsers)?;
    let id = path.into_inner();
    not_self(&auth, id, "delete")?;
    let target = load_user(pool.get_ref(), id).await?;
    keeps_an_admin(&target, false, active_admins(pool.get_ref()).await?)?;

    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE leads SET assigned_to = NULL WHERE assigned_to = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    email_filter::remove(&target.email);
    email_cache::forget(&target.email).await;

    warn!(user_id = id, by = auth.user_id, "User deleted");
    Ok(HttpResponse::Ok().json(json!({ "message": "Successfully deleted" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(role: Role, active: bool) -> User {
        User {
            id: 2,
            email: "a@b.co".into(),
            full_name: "A".into(),
            password: String::new(),
            role_id: role.id(),
            permissions: String::new(),
            is_active: active,
            last_login_at: None,
            created_at: Utc::now(),
        }
    }

    fn actor(id: u64) -> AuthUser {
        AuthUser {
            user_id: id,
            email: "admin@b.co".into(),
            role: Role::Admin,
            permissions: PermissionSet::new(),
        }
    }

    #[test]
    fn last_admin_is_protected() {
        let admin = user(Role::Admin, true);
        assert!(keeps_an_admin(&admin, false, 1).is_err());
        assert!(keeps_an_admin(&admin, false, 2).is_ok());
        assert!(keeps_an_admin(&admin, true, 1).is_ok());
    }

    #[test]
    fn non_admins_and_inactive_admins_are_free_to_change() {
        assert!(keeps_an_admin(&user(Role::Manager, true), false, 1).is_ok());
        assert!(keeps_an_admin(&user(Role::Admin, false), false, 1).is_ok());
    }

    #[test]
    fn self_actions_are_refused() {
        assert!(not_self(&actor(2), 2, "delete").is_err());
        assert!(not_self(&actor(1), 2, "delete").is_ok());
    }

    #[test]
    fn toggle_flips_membership() {
        let mut set = PermissionSet::new();
        assert!(toggle(&mut set, Permission::EditLeads));
        assert!(set.contains(&Permission::EditLeads));
        assert!(!toggle(&mut set, Permission::EditLeads));
        assert!(set.is_empty());
    }

    #[test]
    fn filter_binds_role_id() {
        let query = UserQuery {
            role: Some(Role::Manager),
            active: Some(true),
            ..Default::default()
        };
        let filter = user_filter(&query);
        assert_eq!(filter.where_clause(), " WHERE role_id = ? AND is_active = ?");
        assert!(matches!(filter.args[0], FilterValue::U64(2)));
    }
}
