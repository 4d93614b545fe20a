use crate::{
    auth::{
        auth::AuthUser,
        jwt::{TokenSubject, generate_access_token, generate_refresh_token, verify_token},
        password::{hash_password, verify_password},
    },
    config::Config,
    error::{ApiError, ApiResult, is_duplicate_key},
    model::{
        role::{Role, format_permissions},
        user::{User, UserProfile},
    },
    models::{ChangePasswordReq, LoginReqDto, MIN_PASSWORD_LEN, RegisterReq, TokenPair, TokenType},
    utils::{email_cache, email_filter},
};
use actix_web::{HttpRequest, HttpResponse, web};
use serde_json::json;
use sqlx::{MySql, MySqlPool, Transaction};
use tracing::{debug, error, info, instrument};

const FIRST_USER_SQL: &str = "SELECT id FROM users ORDER BY id LIMIT 1 FOR UPDATE";

pub(crate) const USER_COLUMNS: &str =
    "id, email, full_name, password, role_id, permissions, is_active, last_login_at, created_at";

pub(crate) async fn fetch_user(pool: &MySqlPool, user_id: u64) -> ApiResult<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
    Ok(sqlx::query_as::<_, User>(&sql)
        .bind(user_id)
        .fetch_optional(pool)
        .await?)
}

pub(crate) fn validate_password(password: &str) -> ApiResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

pub(crate) fn hash(password: &str) -> ApiResult<String> {
    hash_password(password).map_err(|e| {
        error!(error = %e, "Password hashing failed");
        ApiError::Internal
    })
}

/// Minimal shape check; the address is confirmed by whoever invites the user.
pub(crate) fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

/// true  => email AVAILABLE
/// false => email TAKEN
pub async fn is_email_available(email: &str, pool: &MySqlPool) -> bool {
    let email = email_filter::normalize(email);

    // Cuckoo filter: a miss is definitive
    if !email_filter::might_exist(&email) {
        return true;
    }

    // Moka cache: a hit is definitive
    if email_cache::is_taken(&email).await {
        return false;
    }

    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE email = ?")
        .bind(&email)
        .fetch_one(pool)
        .await
        .map(|n| n > 0)
        .unwrap_or(true); // fail-safe

    if exists {
        email_cache::mark_taken(&email).await;
    }

    !exists
}

/// Only the very first account is made an admin.
fn role_for_new_account(first_user: Option<u64>) -> Role {
    match first_user {
        None => Role::Admin,
        Some(_) => Role::Staff,
    }
}

async fn insert_user(
    tx: &mut Transaction<'_, MySql>,
    email: &str,
    full_name: &str,
    hashed: &str,
    role: Role,
) -> Result<u64, sqlx::Error> {
    let permissions = format_permissions(&role.default_permissions());

    let done = sqlx::query(
        r#"
        INSERT INTO users (email, full_name, password, role_id, permissions)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(email)
    .bind(full_name)
    .bind(hashed)
    .bind(role.id())
    .bind(permissions)
    .execute(&mut **tx)
    .await?;

    Ok(done.last_insert_id())
}

/// Register an account. The very first account becomes the admin.
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterReq,
    responses(
        (status = 201, description = "User registered", body = Object, example = json!({
            "message": "User registered successfully", "id": 1, "role": "admin"
        })),
        (status = 400, description = "Invalid input"),
        (status = 409, description = "Email already registered")
    ),
    tag = "Auth"
)]
pub async fn register(
    user: web::Json<RegisterReq>,
    pool: web::Data<MySqlPool>,
) -> ApiResult<HttpResponse> {
    let email = email_filter::normalize(&user.email);
    let full_name = user.full_name.trim();

    if email.is_empty() || full_name.is_empty() || user.password.is_empty() {
        return Err(ApiError::bad_request(
            "Email, full name and password must not be empty",
        ));
    }
    if !looks_like_email(&email) {
        return Err(ApiError::bad_request("Invalid email address"));
    }
    validate_password(&user.password)?;

    if !is_email_available(&email, pool.get_ref()).await {
        return Err(ApiError::conflict("Email already registered"));
    }

    let hashed = hash(&user.password)?;

    let mut tx = pool.begin().await?;
    // On an empty table this takes the gap lock, so a concurrent first
    // registration waits here instead of also becoming admin.
    let first_user = sqlx::query_scalar::<_, u64>(FIRST_USER_SQL)
        .fetch_optional(&mut *tx)
        .await?;
    let role = role_for_new_account(first_user);

    let id = match insert_user(&mut tx, &email, full_name, &hashed, role).await {
        Ok(id) => id,
        Err(e) if is_duplicate_key(&e) => {
            return Err(ApiError::conflict("Email already registered"));
        }
        Err(e) => {
            error!(error = %e, "Failed to register user");
            return Err(ApiError::Internal);
        }
    };
    tx.commit().await?;

    email_filter::insert(&email);
    email_cache::mark_taken(&email).await;
    info!(user_id = id, role = %role, "User registered");

    Ok(HttpResponse::Created().json(json!({
        "message": "User registered successfully",
        "id": id,
        "role": role,
    })))
}

async fn issue_tokens(pool: &MySqlPool, config: &Config, user: &User) -> ApiResult<TokenPair> {
    let subject = TokenSubject {
        user_id: user.id,
        email: user.email.clone(),
        role: user.role_id,
        perms: user.permissions.clone(),
    };

    let access_token = generate_access_token(&subject, &config.jwt_secret, config.access_token_ttl)
        .map_err(|e| {
            error!(error = %e, "Failed to sign access token");
            ApiError::Internal
        })?;

    let (refresh_token, refresh_claims) =
        generate_refresh_token(&subject, &config.jwt_secret, config.refresh_token_ttl).map_err(
            |e| {
                error!(error = %e, "Failed to sign refresh token");
                ApiError::Internal
            },
        )?;

    debug!(user_id = user.id, jti = %refresh_claims.jti, "Storing refresh token");

    sqlx::query(
        r#"
        INSERT INTO refresh_tokens (user_id, jti, expires_at)
        VALUES (?, ?, FROM_UNIXTIME(?))
        "#,
    )
    .bind(user.id)
    .bind(&refresh_claims.jti)
    .bind(refresh_claims.exp as i64)
    .execute(pool)
    .await?;

    Ok(TokenPair {
        access_token,
        refresh_token,
    })
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginReqDto,
    responses(
        (status = 200, description = "Token pair", body = TokenPair),
        (status = 401, description = "Invalid credentials"),
        (status = 403, description = "Account disabled")
    ),
    tag = "Auth"
)]
#[instrument(name = "auth_login", skip(pool, config, user), fields(email = %user.email))]
pub async fn login(
    user: web::Json<LoginReqDto>,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
) -> ApiResult<HttpResponse> {
    info!("Login request received");

    if user.email.trim().is_empty() || user.password.is_empty() {
        return Err(ApiError::bad_request("Email and password required"));
    }

    let email = email_filter::normalize(&user.email);
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?");
    let db_user = sqlx::query_as::<_, User>(&sql)
        .bind(&email)
        .fetch_optional(pool.get_ref())
        .await?;

    let db_user = match db_user {
        Some(u) => u,
        None => {
            info!("Invalid credentials: user not found");
            return Err(ApiError::Unauthorized("Invalid credentials".into()));
        }
    };

    if let Err(e) = verify_password(&user.password, &db_user.password) {
        info!(error = %e, "Invalid credentials: password mismatch");
        return Err(ApiError::Unauthorized("Invalid credentials".into()));
    }

    if !db_user.is_active {
        info!(user_id = db_user.id, "Login refused: account disabled");
        return Err(ApiError::forbidden("Account disabled"));
    }

    let tokens = issue_tokens(pool.get_ref(), &config, &db_user).await?;

    if let Err(e) = sqlx::query("UPDATE users SET last_login_at = UTC_TIMESTAMP() WHERE id = ?")
        .bind(db_user.id)
        .execute(pool.get_ref())
        .await
    {
        // not fatal for the login itself
        error!(error = %e, "Failed to update last_login_at");
    }

    info!(user_id = db_user.id, "Login successful");
    Ok(HttpResponse::Ok().json(tokens))
}

fn refresh_claims(req: &HttpRequest, config: &Config) -> Option<crate::models::Claims> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))?;

    verify_token(token, &config.jwt_secret)
        .ok()
        .filter(|c| c.token_type == TokenType::Refresh)
}

/// Rotate a refresh token. Role and permissions are re-read so changes made
/// by an admin reach the user on the next refresh.
#[utoipa::path(
    post,
    path = "/auth/refresh",
    responses(
        (status = 200, description = "New token pair", body = TokenPair),
        (status = 401, description = "Invalid, expired or revoked refresh token")
    ),
    security(("bearer_auth" = [])),
    tag = "Auth"
)]
pub async fn refresh_token(
    req: HttpRequest,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
) -> ApiResult<HttpResponse> {
    let claims = refresh_claims(&req, &config)
        .ok_or_else(|| ApiError::Unauthorized("Invalid refresh token".into()))?;

    let record = sqlx::query_as::<_, (u64, u64, bool)>(
        "SELECT id, user_id, revoked FROM refresh_tokens WHERE jti = ?",
    )
    .bind(&claims.jti)
    .fetch_optional(pool.get_ref())
    .await?;

    let (record_id, user_id) = match record {
        Some((id, user_id, false)) => (id, user_id),
        _ => return Err(ApiError::Unauthorized("Refresh token revoked".into())),
    };

    sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE id = ?")
        .bind(record_id)
        .execute(pool.get_ref())
        .await?;

    let user = match fetch_user(pool.get_ref(), user_id).await? {
        Some(u) if u.is_active => u,
        _ => return Err(ApiError::Unauthorized("Account unavailable".into())),
    };

    let tokens = issue_tokens(pool.get_ref(), &config, &user).await?;
    Ok(HttpResponse::Ok().json(tokens))
}

/// Revoke a refresh token. Always answers 204.
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses((status = 204, description = "Logged out")),
    security(("bearer_auth" = [])),
    tag = "Auth"
)]
pub async fn logout(
    req: HttpRequest,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
) -> HttpResponse {
    if let Some(claims) = refresh_claims(&req, &config) {
        if let Err(e) = sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE jti = ?")
            .bind(&claims.jti)
            .execute(pool.get_ref())
            .await
        {
            error!(error = %e, "Failed to revoke refresh token");
        }
    }

    HttpResponse::NoContent().finish()
}

#[utoipa::path(
    get,
    path = "/api/me",
    responses((status = 200, description = "Current user", body = UserProfile)),
    security(("bearer_auth" = [])),
    tag = "Auth"
)]
pub async fn me(auth: AuthUser, pool: web::Data<MySqlPool>) -> ApiResult<HttpResponse> {
    let user = fetch_user(pool.get_ref(), auth.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User"))?;

    Ok(HttpResponse::Ok().json(UserProfile::from(user)))
}

#[utoipa::path(
    put,
    path = "/api/me/password",
    request_body = ChangePasswordReq,
    responses(
        (status = 200, description = "Password changed"),
        (status = 400, description = "New password too short"),
        (status = 401, description = "Current password is wrong")
    ),
    security(("bearer_auth" = [])),
    tag = "Auth"
)]
pub async fn change_password(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    body: web::Json<ChangePasswordReq>,
) -> ApiResult<HttpResponse> {
    validate_password(&body.new_password)?;

    let user = fetch_user(pool.get_ref(), auth.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User"))?;

    if verify_password(&body.current_password, &user.password).is_err() {
        return Err(ApiError::Unauthorized("Current password is wrong".into()));
    }

    sqlx::query("UPDATE users SET password = ? WHERE id = ?")
        .bind(hash(&body.new_password)?)
        .bind(auth.user_id)
        .execute(pool.get_ref())
        .await?;

    // Existing sessions must log in again.
    sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = ?")
        .bind(auth.user_id)
        .execute(pool.get_ref())
        .await?;

    info!(user_id = auth.user_id, "Password changed");
    Ok(HttpResponse::Ok().json(json!({ "message": "Password changed" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::App;
    use actix_web::test::{TestRequest, call_service, init_service};

    #[test]
    fn email_shape() {
        assert!(looks_like_email("jane@company.com"));
        assert!(!looks_like_email("jane@company"));
        assert!(!looks_like_email("@company.com"));
        assert!(!looks_like_email("jane doe@company.com"));
        assert!(!looks_like_email("jane@.com"));
        assert!(!looks_like_email("plain"));
    }

    #[test]
    fn only_the_first_account_becomes_admin() {
        assert_eq!(role_for_new_account(None), Role::Admin);
        assert_eq!(role_for_new_account(Some(1)), Role::Staff);
    }

    #[test]
    fn first_user_lookup_locks() {
        assert!(FIRST_USER_SQL.ends_with("FOR UPDATE"));
    }

    #[test]
    fn short_passwords_rejected() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long enough").is_ok());
    }

    #[actix_web::test]
    async fn logout_without_token_is_no_content() {
        let config = Config::for_tests();
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();

        let app = init_service(
            App::new()
                .app_data(web::Data::new(pool))
                .app_data(web::Data::new(config))
                .route("/auth/logout", web::post().to(logout)),
        )
        .await;

        let req = TestRequest::post().uri("/auth/logout").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), 204);
    }

    #[actix_web::test]
    async fn refresh_without_token_is_unauthorized() {
        let config = Config::for_tests();
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();

        let app = init_service(
            App::new()
                .app_data(web::Data::new(pool))
                .app_data(web::Data::new(config))
                .route("/auth/refresh", web::post().to(refresh_token)),
        )
        .await;

        let req = TestRequest::post().uri("/auth/refresh").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }
}
