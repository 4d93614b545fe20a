use actix_web::{HttpRequest, HttpResponse, http::header, web};
use serde::Deserialize;
use serde_json::json;
use sqlx::{MySql, MySqlPool, Transaction};
use tracing::{error, info};
use utoipa::IntoParams;

use crate::{
    auth::auth::AuthUser,
    config::Config,
    error::{ApiError, ApiResult},
    model::{
        attachment::{Attachment, OwnerKind},
        role::Permission,
    },
    storage::{LocalStore, sanitize_filename, storage_key},
};

const ATTACHMENT_COLUMNS: &str =
    "id, owner_kind, owner_id, filename, content_type, size_bytes, storage_key, uploaded_by, created_at";

#[derive(Debug, Deserialize, IntoParams)]
pub struct UploadQuery {
    /// Original file name
    pub filename: String,
}

fn read_permission(kind: OwnerKind) -> Permission {
    match kind {
        OwnerKind::Lead => Permission::ViewLeads,
        OwnerKind::Candidate => Permission::ManageRecruitment,
    }
}

fn write_permission(kind: OwnerKind) -> Permission {
    match kind {
        OwnerKind::Lead => Permission::EditLeads,
        OwnerKind::Candidate => Permission::ManageRecruitment,
    }
}

fn owner_table(kind: OwnerKind) -> &'static str {
    match kind {
        OwnerKind::Lead => "leads",
        OwnerKind::Candidate => "candidates",
    }
}

async fn owner_exists(pool: &MySqlPool, kind: OwnerKind, owner_id: u64) -> ApiResult<bool> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?", owner_table(kind));
    let count = sqlx::query_scalar::<_, i64>(&sql)
        .bind(owner_id)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

async fn fetch_attachment(pool: &MySqlPool, id: u64) -> ApiResult<Attachment> {
    let sql = format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?");
    sqlx::query_as::<_, Attachment>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Attachment"))
}

fn attachment_kind(a: &Attachment) -> ApiResult<OwnerKind> {
    a.owner_kind.parse().map_err(|_| {
        error!(attachment_id = a.id, owner_kind = %a.owner_kind, "Unknown attachment owner");
        ApiError::Internal
    })
}

fn content_type_of(req: &HttpRequest) -> String {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

/// Store the raw request body as a file attached to a lead or candidate.
#[allow(clippy::too_many_arguments)]
pub async fn upload(
    kind: OwnerKind,
    owner_id: u64,
    auth: &AuthUser,
    req: &HttpRequest,
    pool: &MySqlPool,
    config: &Config,
    store: &LocalStore,
    filename: &str,
    body: web::Bytes,
) -> ApiResult<HttpResponse> {
    auth.require(write_permission(kind))?;

    if body.is_empty() {
        return Err(ApiError::bad_request("Empty upload"));
    }
    if body.len() > config.max_upload_bytes {
        return Err(ApiError::PayloadTooLarge(config.max_upload_bytes));
    }
    if !owner_exists(pool, kind, owner_id).await? {
        return Err(ApiError::not_found(match kind {
            OwnerKind::Lead => "Lead",
            OwnerKind::Candidate => "Candidate",
        }));
    }

    let filename = sanitize_filename(filename);
    let key = storage_key(kind, owner_id, &filename);
    let content_type = content_type_of(req);
    let size = body.len() as u64;

    store.save(&key, body).await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO attachments
            (owner_kind, owner_id, filename, content_type, size_bytes, storage_key, uploaded_by)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(kind.as_ref())
    .bind(owner_id)
    .bind(&filename)
    .bind(&content_type)
    .bind(size)
    .bind(&key)
    .bind(auth.user_id)
    .execute(pool)
    .await;

    let inserted = match inserted {
        Ok(done) => done,
        Err(e) => {
            // keep the bucket free of orphans
            if let Err(cleanup) = store.remove(&key).await {
                error!(error = %cleanup, key = %key, "Failed to remove orphaned upload");
            }
            return Err(e.into());
        }
    };

    info!(owner_kind = %kind, owner_id, size, "Attachment uploaded");
    Ok(HttpResponse::Created().json(json!({
        "id": inserted.last_insert_id(),
        "filename": filename,
        "content_type": content_type,
        "size_bytes": size,
    })))
}

pub async fn list(
    kind: OwnerKind,
    owner_id: u64,
    auth: &AuthUser,
    pool: &MySqlPool,
) -> ApiResult<HttpResponse> {
    auth.require(read_permission(kind))?;

    let sql = format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments \
         WHERE owner_kind = ? AND owner_id = ? ORDER BY created_at DESC, id DESC"
    );
    let rows = sqlx::query_as::<_, Attachment>(&sql)
        .bind(kind.as_ref())
        .bind(owner_id)
        .fetch_all(pool)
        .await?;

    Ok(HttpResponse::Ok().json(rows))
}

/// Delete an owner's attachment rows inside `tx`; returns the storage keys to
/// remove once the transaction commits.
pub async fn detach_owner(
    tx: &mut Transaction<'_, MySql>,
    kind: OwnerKind,
    owner_id: u64,
) -> Result<Vec<String>, sqlx::Error> {
    let keys = sqlx::query_scalar::<_, String>(
        "SELECT storage_key FROM attachments WHERE owner_kind = ? AND owner_id = ? FOR UPDATE",
    )
    .bind(kind.as_ref())
    .bind(owner_id)
    .fetch_all(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM attachments WHERE owner_kind = ? AND owner_id = ?")
        .bind(kind.as_ref())
        .bind(owner_id)
        .execute(&mut **tx)
        .await?;

    Ok(keys)
}

/// Best effort; a file that cannot be removed is only logged.
pub async fn remove_files(store: &LocalStore, keys: &[String]) {
    for key in keys {
        if let Err(e) = store.remove(key).await {
            error!(error = %e, key = %key, "Failed to remove stored file");
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/attachments/{attachment_id}",
    params(("attachment_id" = u64, Path, description = "Attachment id")),
    responses(
        (status = 200, description = "File contents", content_type = "application/octet-stream"),
        (status = 404, description = "Attachment not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Attachments"
)]
pub async fn download(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    store: web::Data<LocalStore>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    let attachment = fetch_attachment(pool.get_ref(), path.into_inner()).await?;
    auth.require(read_permission(attachment_kind(&attachment)?))?;

    let bytes = store.read(&attachment.storage_key).await?;

    Ok(HttpResponse::Ok()
        .content_type(attachment.content_type.as_str())
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", attachment.filename.replace('"', "")),
        ))
        .body(bytes))
}

#[utoipa::path(
    delete,
    path = "/api/attachments/{attachment_id}",
    params(("attachment_id" = u64, Path, description = "Attachment id")),
    responses(
        (status = 200, description = "Deleted"),
        (status = 404, description = "Attachment not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Attachments"
)]
pub async fn delete(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    store: web::Data<LocalStore>,
    path: web::Path<u64>,
) -> ApiResult<HttpResponse> {
    let attachment = fetch_attachment(pool.get_ref(), path.into_inner()).await?;
    auth.require(write_permission(attachment_kind(&attachment)?))?;

    sqlx::query("DELETE FROM attachments WHERE id = ?")
        .bind(attachment.id)
        .execute(pool.get_ref())
        .await?;

    if let Err(e) = store.remove(&attachment.storage_key).await {
        error!(error = %e, attachment_id = attachment.id, "Failed to remove stored file");
    }

    Ok(HttpResponse::Ok().json(json!({ "message": "Successfully deleted" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn content_type_drops_parameters() {
        let req = TestRequest::default()
            .insert_header((header::CONTENT_TYPE, "text/plain; charset=utf-8"))
            .to_http_request();
        assert_eq!(content_type_of(&req), "text/plain");
    }

    #[test]
    fn content_type_defaults_to_octet_stream() {
        let req = TestRequest::default().to_http_request();
        assert_eq!(content_type_of(&req), "application/octet-stream");
    }

    #[test]
    fn candidate_files_need_recruitment_permission() {
        assert_eq!(read_permission(OwnerKind::Candidate), Permission::ManageRecruitment);
        assert_eq!(write_permission(OwnerKind::Lead), Permission::EditLeads);
        assert_eq!(read_permission(OwnerKind::Lead), Permission::ViewLeads);
    }

    #[actix_web::test]
    async fn removing_files_skips_missing_keys() {
        let root = std::env::temp_dir().join(format!("opsdash_files_{}", uuid::Uuid::new_v4()));
        let store = LocalStore::new(&root);
        let kept = storage_key(OwnerKind::Lead, 9, "quote.pdf");
        store.save(&kept, web::Bytes::from_static(b"quote")).await.unwrap();

        let keys = vec![storage_key(OwnerKind::Lead, 9, "gone.pdf"), kept.clone()];
        remove_files(&store, &keys).await;

        assert!(store.read(&kept).await.is_err());
        let _ = std::fs::remove_dir_all(root);
    }
}
