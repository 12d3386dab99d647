//! 文件列表、上传、下载与目录操作处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Multipart, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::archive;
use crate::atomic::AtomicFile;
use crate::config::DEFAULT_LOCK_WAIT_TIMEOUT_SECS;
use crate::error::ApiError;
use crate::locking::UserLocks;
use crate::storage::{FileEntry, Storage};
use crate::token::Principal;

#[derive(Deserialize)]
pub(crate) struct OptionalPathQuery {
    path: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct RequiredPathQuery {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct DirCreateBody {
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RenameBody {
    old_path: String,
    new_name: String,
}

#[derive(Deserialize)]
pub(crate) struct MoveBody {
    source: String,
    target: String,
}

/// 列出目录内容。
pub async fn list_files(
    Query(query): Query<OptionalPathQuery>,
    Extension(principal): Extension<Principal>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<Vec<FileEntry>>, ApiError> {
    let entries = storage
        .list_dir(&principal.username, query.path.as_deref())
        .await?;
    debug!(
        username = principal.username,
        path = query.path.as_deref().unwrap_or(""),
        count = entries.len(),
        "list files"
    );
    Ok(JsonResponse(entries))
}

/// 上传文件：目标目录按需创建，同名文件被原子替换。
pub async fn upload_file(
    Query(query): Query<OptionalPathQuery>,
    Extension(principal): Extension<Principal>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<UserLocks>>,
    mut multipart: Multipart,
) -> Result<StatusCode, ApiError> {
    let _guard = locks
        .acquire_with_timeout(
            &principal.username,
            Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
        )
        .await
        .map_err(|_| ApiError::Conflict("user storage busy".into()))?;

    let mut saved = 0usize;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let target = storage
            .resolve_upload_target(&principal.username, query.path.as_deref(), &file_name)
            .await?;

        let mut atomic = AtomicFile::create(&target)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let write_result: Result<u64, ApiError> = async {
            let mut written: u64 = 0;
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|err| ApiError::BadRequest(err.to_string()))?
            {
                written += chunk.len() as u64;
                atomic
                    .file_mut()
                    .write_all(&chunk)
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
            }
            Ok(written)
        }
        .await;

        match write_result {
            Ok(bytes) => {
                atomic
                    .finalize()
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
                info!(
                    username = principal.username,
                    file_name,
                    bytes,
                    "file uploaded"
                );
                saved += 1;
            }
            Err(err) => {
                atomic.cleanup().await;
                return Err(err);
            }
        }
    }

    if saved == 0 {
        return Err(ApiError::BadRequest("file field is required".into()));
    }
    Ok(StatusCode::CREATED)
}

/// 下载：文件按原样流式返回，目录即时打包为 zip。
pub async fn download_file(
    Query(RequiredPathQuery { path }): Query<RequiredPathQuery>,
    Extension(principal): Extension<Principal>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let (target, metadata) = storage.resolve_entry(&principal.username, &path).await?;

    if metadata.is_dir() {
        let dir_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| principal.username.clone());
        let handle = archive::archive_directory(&target)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let file = File::open(handle.path())
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let size = file
            .metadata()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?
            .len();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/zip"),
        );
        insert_content_length(&mut headers, size)?;
        headers.insert(
            header::CONTENT_DISPOSITION,
            attachment_disposition(&format!("{dir_name}.zip"))?,
        );

        info!(
            username = principal.username,
            path,
            size,
            "download directory archive"
        );
        let stream = ReaderStream::new(file);
        return Ok((StatusCode::OK, headers, AxumBody::from_stream(stream)).into_response());
    }

    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let mime = mime_guess::from_path(&target).first_or_octet_stream();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
    );
    insert_content_length(&mut headers, metadata.len())?;
    headers.insert(
        header::CONTENT_DISPOSITION,
        attachment_disposition(&file_name)?,
    );
    if let Ok(modified) = metadata.modified() {
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
        );
    }

    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    info!(
        username = principal.username,
        path,
        size = metadata.len(),
        "download file"
    );
    let stream = ReaderStream::new(file);
    Ok((StatusCode::OK, headers, AxumBody::from_stream(stream)).into_response())
}

/// 创建目录（含父级）。
pub async fn create_directory(
    Extension(principal): Extension<Principal>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<UserLocks>>,
    Json(DirCreateBody { path }): Json<DirCreateBody>,
) -> Result<StatusCode, ApiError> {
    if path.is_empty() {
        return Err(ApiError::BadRequest("path is required".into()));
    }
    let _guard = locks
        .acquire_with_timeout(
            &principal.username,
            Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
        )
        .await
        .map_err(|_| ApiError::Conflict("user storage busy".into()))?;
    storage.create_dir(&principal.username, &path).await?;
    info!(username = principal.username, path, "directory created");
    Ok(StatusCode::CREATED)
}

/// 递归删除文件或目录。
pub async fn delete_entry(
    Query(RequiredPathQuery { path }): Query<RequiredPathQuery>,
    Extension(principal): Extension<Principal>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<UserLocks>>,
) -> Result<StatusCode, ApiError> {
    if path.is_empty() {
        return Err(ApiError::BadRequest("path is required".into()));
    }
    let _guard = locks
        .acquire_with_timeout(
            &principal.username,
            Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
        )
        .await
        .map_err(|_| ApiError::Conflict("user storage busy".into()))?;
    storage.delete_path(&principal.username, &path).await?;
    info!(username = principal.username, path, "entry deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// 同父目录内改名。
pub async fn rename_entry(
    Extension(principal): Extension<Principal>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<UserLocks>>,
    Json(RenameBody { old_path, new_name }): Json<RenameBody>,
) -> Result<StatusCode, ApiError> {
    if old_path.is_empty() {
        return Err(ApiError::BadRequest("oldPath is required".into()));
    }
    let _guard = locks
        .acquire_with_timeout(
            &principal.username,
            Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
        )
        .await
        .map_err(|_| ApiError::Conflict("user storage busy".into()))?;
    storage
        .rename_entry(&principal.username, &old_path, &new_name)
        .await?;
    info!(
        username = principal.username,
        old_path, new_name, "entry renamed"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// 移动条目，目标父目录按需创建。
pub async fn move_entry(
    Extension(principal): Extension<Principal>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<UserLocks>>,
    Json(MoveBody { source, target }): Json<MoveBody>,
) -> Result<StatusCode, ApiError> {
    if source.is_empty() || target.is_empty() {
        return Err(ApiError::BadRequest("source and target are required".into()));
    }
    let _guard = locks
        .acquire_with_timeout(
            &principal.username,
            Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
        )
        .await
        .map_err(|_| ApiError::Conflict("user storage busy".into()))?;
    storage
        .move_entry(&principal.username, &source, &target)
        .await?;
    info!(username = principal.username, source, target, "entry moved");
    Ok(StatusCode::NO_CONTENT)
}

fn insert_content_length(headers: &mut HeaderMap, size: u64) -> Result<(), ApiError> {
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&size.to_string())
            .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
    );
    Ok(())
}

/// 构造 attachment 响应头；文件名清洗为 ASCII 安全形式。
fn attachment_disposition(name: &str) -> Result<HeaderValue, ApiError> {
    let safe: String = name
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .map(|c| match c {
            '"' | '\\' => '_',
            other => other,
        })
        .collect();
    let safe = if safe.is_empty() {
        "download".to_string()
    } else {
        safe
    };
    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .map_err(|_| ApiError::Internal("响应头构建失败".into()))
}
