use actix_web::{HttpRequest, HttpResponse, web};
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::{MySql, MySqlPool, Transaction};
use tracing::info;
use utoipa::ToSchema;

use crate::{
    api::attachments::{self, UploadQuery},
    auth::auth::AuthUser,
    config::Config,
    error::{ApiError, ApiResult},
    model::{
        attachment::OwnerKind,
        pipeline::{Candidate, Stage},
        role::Permission,
    },
    recruitment::{Card, build_board, plan_compact, plan_move, plan_stage_order},
    storage::LocalStore,
    utils::db_utils::{build_update_sql, execute_update},
};

const STAGE_COLUMNS: &str = "id, name, position";
const CANDIDATE_COLUMNS: &str = "id, stage_id, position, name, email, phone, role_applied, \
     lead_id, notes, created_at, updated_at";
const CANDIDATE_UPDATABLE: &[&str] = &["name", "email", "phone", "role_applied", "lead_id", "notes"];

#[derive(Debug, Deserialize, ToSchema)]
pub struct StageReq {
    #[schema(example = "Reference check")]
    pub name: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MoveStageReq {
    #[schema(example = 0)]
    pub to_index: usize,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateCandidateReq {
    pub stage_id: u64,
    #[schema(example = "Sam Rivera")]
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role_applied: Option<String>,
    pub lead_id: Option<u64>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MoveCandidateReq {
    pub stage_id: u64,
    /// Clamped to the column length
    #[schema(example = 0)]
    pub to_index: usize,
}

fn non_empty(name: &str) -> ApiResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("Name must not be empty"));
    }
    Ok(name)
}

async fn fetch_stage(pool: &MySqlPool, id: u64) -> ApiResult<Stage> {
    let sql = format!("SELECT {STAGE_COLUMNS} FROM pipeline_stages WHERE id = ?");
    sqlx::query_as::<_, Stage>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Stage"))
}

async fn fetch_candidate(pool: &MySqlPool, id: u64) -> ApiResult<Candidate> {
    let sql = format!("SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE id = ?");
    sqlx::query_as::<_, Candidate>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Candidate"))
}

/// Lock and load the cards of the given columns.
async fn lock_cards(
    tx: &mut Transaction<'_, MySql>,
    first: u64,
    second: u64,
) -> Result<Vec<Card>, sqlx::Error> {
    sqlx::query_as::<_, Card>(
        "SELECT id, stage_id, position FROM candidates WHERE stage_id IN (?, ?) FOR UPDATE",
    )
    .bind(first)
    .bind(second)
    .fetch_all(&mut **tx)
    .await
}

async fn apply_cards(tx: &mut Transaction<'_, MySql>, plan: &[Card]) -> Result<(), sqlx::Error> {
    for card in plan {
        sqlx::query("UPDATE candidates SET stage_id = ?, position = ? WHERE id = ?")
            .bind(card.stage_id)
            .bind(card.position)
            .bind(card.id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/api/recruitment/board",
    responses((status = 200, description = "Stages with their candidates", body = [crate::recruitment::StageColumn])),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
)]
pub async fn board(auth: AuthUser, pool: web::Data<MySqlPool>) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageRecruitment)?;

    let stages = sqlx::query_as::<_, Stage>(&format!("SELECT {STAGE_COLUMNS} FROM pipeline_stages"))
        .fetch_all(pool.get_ref())
        .await?;
    let candidates =
        sqlx::query_as::<_, Candidate>(&format!("SELECT {CANDIDATE_COLUMNS} FROM candidates"))
            .fetch_all(pool.get_ref())
            .await?;

    Ok(HttpResponse::Ok().json(build_board(stages, candidates)))
}

#[utoipa::path(
    post,
    path = "/api/recruitment/stages",
    request_body = StageReq,
    responses((status = 201, description = "Stage appended", body = Stage)),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
)]
pub async fn create_stage(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    body: web::Json<StageReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageRecruitment)?;
    let name = non_empty(&body.name)?;

    let mut tx = pool.begin().await?;
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pipeline_stages FOR UPDATE")
        .fetch_one(&mut *tx)
        .await?;
    let inserted = sqlx::query("INSERT INTO pipeline_stages (name, position) VALUES (?, ?)")
        .bind(name)
        .bind(count as u32)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let stage = fetch_stage(pool.get_ref(), inserted.last_insert_id()).await?;
    info!(stage_id = stage.id, "Stage created");
    Ok(HttpResponse::Created().json(stage))
}

#[utoipa::path(
    put,
    path = "/api/recruitment/stages/{stage_id}",
    params(("stage_id" = u64, Path, description = "Stage id")),
    request_body = StageReq,
    responses((status = 200, description = "Renamed", body = Stage), (status = 404, description = "Stage not found")),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
)]
pub async fn rename_stage(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<StageReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageRecruitment)?;
    let id = path.into_inner();
    let name = non_empty(&body.name)?;
    fetch_stage(pool.get_ref(), id).await?;

    sqlx::query("UPDATE pipeline_stages SET name = ? WHERE id = ?")
        .bind(name)
        .bind(id)
        .execute(pool.get_ref())
        .await?;

    Ok(HttpResponse::Ok().json(fetch_stage(pool.get_ref(), id).await?))
}

#[utoipa::path(
    put,
    path = "/api/recruitment/stages/{stage_id}/move",
    params(("stage_id" = u64, Path, description = "Stage id")),
    request_body = MoveStageReq,
    responses((status = 200, description = "Board after the move", body = [crate::recruitment::StageColumn]), (status = 404, description = "Stage not found")),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
)]
pub async fn move_stage(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<MoveStageReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageRecruitment)?;
    let id = path.into_inner();

    let mut tx = pool.begin().await?;
    let stages = sqlx::query_as::<_, Stage>(&format!(
        "SELECT {STAGE_COLUMNS} FROM pipeline_stages FOR UPDATE"
    ))
    .fetch_all(&mut *tx)
    .await?;

    let plan = plan_stage_order(&stages, id, body.to_index)
        .ok_or_else(|| ApiError::not_found("Stage"))?;

    for (stage_id, position) in &plan {
        sqlx::query("UPDATE pipeline_stages SET position = ? WHERE id = ?")
            .bind(position)
            .bind(stage_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    board(auth, pool).await
}

#[utoipa::path(
    delete,
    path = "/api/recruitment/stages/{stage_id}",
    params(("stage_id" = u64, Path, description = "Stage id")),
    responses(
        (status = 200, description = "Deleted"),
        (status = 404, description = "Stage not found"),
        (status = 409, description = "Stage still has candidates")
    ),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
)]
pub async fn delete_stage(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageRecruitment)?;
    let id = path.into_inner();
    fetch_stage(pool.get_ref(), id).await?;

    let mut tx = pool.begin().await?;
    let occupied = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM candidates WHERE stage_id = ? FOR UPDATE",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;
    if occupied > 0 {
        return Err(ApiError::conflict("Stage still has candidates"));
    }

    sqlx::query("DELETE FROM pipeline_stages WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let remaining = sqlx::query_as::<_, Stage>(&format!(
        "SELECT {STAGE_COLUMNS} FROM pipeline_stages FOR UPDATE"
    ))
    .fetch_all(&mut *tx)
    .await?;
    // moving the first stage onto its own slot renumbers the rest densely
    if let Some(first) = remaining.iter().min_by_key(|s| (s.position, s.id)) {
        let plan = plan_stage_order(&remaining, first.id, 0).unwrap_or_default();
        for (stage_id, position) in &plan {
            sqlx::query("UPDATE pipeline_stages SET position = ? WHERE id = ?")
                .bind(position)
                .bind(stage_id)
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await?;

    info!(stage_id = id, "Stage deleted");
    Ok(HttpResponse::Ok().json(json!({ "message": "Successfully deleted" })))
}

#[utoipa::path(
    post,
    path = "/api/recruitment/candidates",
    request_body = CreateCandidateReq,
    responses(
        (status = 201, description = "Candidate appended to the stage", body = Candidate),
        (status = 404, description = "Stage not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
)]
pub async fn create_candidate(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    body: web::Json<CreateCandidateReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageRecruitment)?;
    let name = non_empty(&body.name)?;
    fetch_stage(pool.get_ref(), body.stage_id).await?;

    let mut tx = pool.begin().await?;
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM candidates WHERE stage_id = ? FOR UPDATE",
    )
    .bind(body.stage_id)
    .fetch_one(&mut *tx)
    .await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO candidates
            (stage_id, position, name, email, phone, role_applied, lead_id, notes)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(body.stage_id)
    .bind(count as u32)
    .bind(name)
    .bind(&body.email)
    .bind(&body.phone)
    .bind(&body.role_applied)
    .bind(body.lead_id)
    .bind(&body.notes)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let candidate = fetch_candidate(pool.get_ref(), inserted.last_insert_id()).await?;
    info!(candidate_id = candidate.id, stage_id = candidate.stage_id, "Candidate created");
    Ok(HttpResponse::Created().json(candidate))
}

#[utoipa::path(
    get,
    path = "/api/recruitment/candidates/{candidate_id}",
    params(("candidate_id" = u64, Path, description = "Candidate id")),
    responses((status = 200, description = "Candidate", body = Candidate), (status = 404, description = "Candidate not found")),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
)]
pub async fn get_candidate(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageRecruitment)?;
    Ok(HttpResponse::Ok().json(fetch_candidate(pool.get_ref(), path.into_inner()).await?))
}

#[utoipa::path(
    patch,
    path = "/api/recruitment/candidates/{candidate_id}",
    params(("candidate_id" = u64, Path, description = "Candidate id")),
    request_body(content = Object, example = json!({"role_applied": "Dispatcher", "notes": "Strong references"})),
    responses(
        (status = 200, description = "Updated candidate", body = Candidate),
        (status = 400, description = "Unknown field"),
        (status = 404, description = "Candidate not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
)]
pub async fn update_candidate(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<Value>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageRecruitment)?;
    let id = path.into_inner();

    let update = build_update_sql("candidates", &body, CANDIDATE_UPDATABLE, "id", id)?;
    if let Some(name) = body.get("name") {
        non_empty(name.as_str().unwrap_or_default())?;
    }

    fetch_candidate(pool.get_ref(), id).await?;
    execute_update(pool.get_ref(), update).await?;

    Ok(HttpResponse::Ok().json(fetch_candidate(pool.get_ref(), id).await?))
}

#[utoipa::path(
    put,
    path = "/api/recruitment/candidates/{candidate_id}/move",
    params(("candidate_id" = u64, Path, description = "Candidate id")),
    request_body = MoveCandidateReq,
    responses(
        (status = 200, description = "Moved candidate", body = Candidate),
        (status = 404, description = "Candidate or stage not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
)]
pub async fn move_candidate(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    body: web::Json<MoveCandidateReq>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageRecruitment)?;
    let id = path.into_inner();
    fetch_stage(pool.get_ref(), body.stage_id).await?;

    let mut tx = pool.begin().await?;
    let from_stage = sqlx::query_scalar::<_, u64>("SELECT stage_id FROM candidates WHERE id = ? FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ApiError::not_found("Candidate"))?;

    let cards = lock_cards(&mut tx, from_stage, body.stage_id).await?;
    let plan = plan_move(&cards, id, body.stage_id, body.to_index)
        .ok_or_else(|| ApiError::not_found("Candidate"))?;
    apply_cards(&mut tx, &plan).await?;
    tx.commit().await?;

    info!(
        candidate_id = id,
        from = from_stage,
        to = body.stage_id,
        index = body.to_index,
        "Candidate moved"
    );
    Ok(HttpResponse::Ok().json(fetch_candidate(pool.get_ref(), id).await?))
}

#[utoipa::path(
    delete,
    path = "/api/recruitment/candidates/{candidate_id}",
    params(("candidate_id" = u64, Path, description = "Candidate id")),
    responses((status = 200, description = "Deleted"), (status = 404, description = "Candidate not found")),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
)]
pub async fn delete_candidate(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    store: web::Data<LocalStore>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    auth.require(Permission::ManageRecruitment)?;
    let id = path.into_inner();
    let candidate = fetch_candidate(pool.get_ref(), id).await?;

    let mut tx = pool.begin().await?;
    let keys = attachments::detach_owner(&mut tx, OwnerKind::Candidate, id).await?;
    sqlx::query("DELETE FROM candidates WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let cards = lock_cards(&mut tx, candidate.stage_id, candidate.stage_id).await?;
    apply_cards(&mut tx, &plan_compact(&cards, candidate.stage_id)).await?;
    tx.commit().await?;
    attachments::remove_files(store.get_ref(), &keys).await;

    info!(candidate_id = id, "Candidate deleted");
    Ok(HttpResponse::Ok().json(json!({ "message": "Successfully deleted" })))
}

#[utoipa::path(
    post,
    path = "/api/recruitment/candidates/{candidate_id}/attachments",
    params(("candidate_id" = u64, Path, description = "Candidate id"), UploadQuery),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "Attachment stored"),
        (status = 404, description = "Candidate not found"),
        (status = 413, description = "File too large")
    ),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
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
        OwnerKind::Candidate,
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
    path = "/api/recruitment/candidates/{candidate_id}/attachments",
    params(("candidate_id" = u64, Path, description = "Candidate id")),
    responses((status = 200, description = "Attachments, newest first", body = [crate::model::attachment::Attachment])),
    security(("bearer_auth" = [])),
    tag = "Recruitment"
)]
pub async fn list_attachments(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    attachments::list(OwnerKind::Candidate, path.into_inner(), &auth, pool.get_ref()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_and_required() {
        assert_eq!(non_empty("  Offer ").unwrap(), "Offer");
        assert!(non_empty("   ").is_err());
    }

    #[test]
    fn stage_id_is_not_a_plain_update() {
        let err = build_update_sql(
            "candidates",
            &json!({"stage_id": 3}),
            CANDIDATE_UPDATABLE,
            "id",
            1,
        )
        .unwrap_err();
        assert!(err.to_string().contains("stage_id"));

        let err = build_update_sql("candidates", &json!({"position": 0}), CANDIDATE_UPDATABLE, "id", 1)
            .unwrap_err();
        assert!(err.to_string().contains("position"));
    }

    #[test]
    fn move_request_parses() {
        let req: MoveCandidateReq = serde_json::from_str(r#"{"stage_id": 4, "to_index": 2}"#).unwrap();
        assert_eq!((req.stage_id, req.to_index), (4, 2));
    }
}
