//! Blob operations for the registry
//!
//! Blob payloads can be multi-gigabyte image layers, so GET responses
//! stream straight from the storage driver rather than buffering.

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use bytes::Bytes;
use tokio_util::io::ReaderStream;

use crate::error::{RegistryError, RegistryResult};
use crate::storage::RegistryStorage;

/// Router for blob operations
pub fn router(read_only: bool) -> Router<RegistryStorage> {
    let mut blobs = get(get_blob).head(head_blob);
    let mut nested_blobs = get(get_nested_blob).head(head_nested_blob);

    if !read_only {
        blobs = blobs.delete(delete_blob);
        nested_blobs = nested_blobs.delete(delete_nested_blob);
    }

    let mut router = Router::new()
        .route("/v2/{name}/blobs/{digest}", blobs)
        .route("/v2/{name}/{subname}/blobs/{digest}", nested_blobs);

    if !read_only {
        router = router
            .route("/v2/{name}/blobs/uploads/", post(start_blob_upload))
            .route(
                "/v2/{name}/{subname}/blobs/uploads/",
                post(start_nested_blob_upload),
            )
            .route(
                "/v2/{name}/blobs/uploads/{uuid}",
                put(complete_blob_upload).delete(cancel_blob_upload),
            )
            .route(
                "/v2/{name}/{subname}/blobs/uploads/{uuid}",
                put(complete_nested_blob_upload).delete(cancel_nested_blob_upload),
            );
    }

    router
}

/// Get a blob
async fn get_blob(
    State(storage): State<RegistryStorage>,
    Path((name, digest)): Path<(String, String)>,
) -> RegistryResult<Response> {
    stream_blob(&storage, &name, &digest).await
}

async fn get_nested_blob(
    State(storage): State<RegistryStorage>,
    Path((org, name, digest)): Path<(String, String, String)>,
) -> RegistryResult<Response> {
    stream_blob(&storage, &format!("{org}/{name}"), &digest).await
}

async fn stream_blob(
    storage: &RegistryStorage,
    name: &str,
    digest: &str,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    validate_digest(digest)?;

    let (info, reader) = storage.blob_reader(digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, info.size.to_string()),
            (
                header::HeaderName::from_static("docker-content-digest"),
                digest.to_string(),
            ),
        ],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

/// Check if a blob exists
async fn head_blob(
    State(storage): State<RegistryStorage>,
    Path((name, digest)): Path<(String, String)>,
) -> RegistryResult<Response> {
    probe_blob(&storage, &name, &digest).await
}

async fn head_nested_blob(
    State(storage): State<RegistryStorage>,
    Path((org, name, digest)): Path<(String, String, String)>,
) -> RegistryResult<Response> {
    probe_blob(&storage, &format!("{org}/{name}"), &digest).await
}

async fn probe_blob(
    storage: &RegistryStorage,
    name: &str,
    digest: &str,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    validate_digest(digest)?;

    if storage.blob_exists(digest).await? {
        Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::HeaderName::from_static("docker-content-digest"),
                    digest.to_string(),
                ),
            ],
        )
            .into_response())
    } else {
        Err(RegistryError::BlobNotFound(digest.to_string()))
    }
}

/// Delete a blob
async fn delete_blob(
    State(storage): State<RegistryStorage>,
    Path((name, digest)): Path<(String, String)>,
) -> RegistryResult<StatusCode> {
    validate_repository(&name)?;
    validate_digest(&digest)?;

    storage.delete_blob(&digest).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn delete_nested_blob(
    State(storage): State<RegistryStorage>,
    Path((org, name, digest)): Path<(String, String, String)>,
) -> RegistryResult<StatusCode> {
    let name = format!("{org}/{name}");
    validate_repository(&name)?;
    validate_digest(&digest)?;

    storage.delete_blob(&digest).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Start a blob upload session
async fn start_blob_upload(Path(name): Path<String>) -> RegistryResult<Response> {
    open_upload_session(&name)
}

async fn start_nested_blob_upload(
    Path((org, name)): Path<(String, String)>,
) -> RegistryResult<Response> {
    open_upload_session(&format!("{org}/{name}"))
}

fn open_upload_session(name: &str) -> RegistryResult<Response> {
    validate_repository(name)?;

    let uuid = uuid::Uuid::new_v4();
    let location = format!("/v2/{name}/blobs/uploads/{uuid}");

    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, location),
            (header::RANGE, "0-0".to_string()),
        ],
    )
        .into_response())
}

/// Query parameters accepted when completing an upload
#[derive(Debug, serde::Deserialize)]
struct UploadQuery {
    digest: Option<String>,
}

/// Complete a blob upload
///
/// Monolithic uploads only: the whole payload arrives in this request,
/// with the expected digest in the `digest` query parameter.
async fn complete_blob_upload(
    State(storage): State<RegistryStorage>,
    Path((name, _uuid)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> RegistryResult<Response> {
    finish_upload(&storage, &name, query, &body).await
}

async fn complete_nested_blob_upload(
    State(storage): State<RegistryStorage>,
    Path((org, name, _uuid)): Path<(String, String, String)>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> RegistryResult<Response> {
    finish_upload(&storage, &format!("{org}/{name}"), query, &body).await
}

async fn finish_upload(
    storage: &RegistryStorage,
    name: &str,
    query: UploadQuery,
    body: &[u8],
) -> RegistryResult<Response> {
    validate_repository(name)?;

    let digest = query
        .digest
        .ok_or_else(|| RegistryError::BlobUploadInvalid("missing digest".to_string()))?;
    validate_digest(&digest)?;

    storage.put_blob(name, &digest, body).await?;

    let location = format!("/v2/{name}/blobs/{digest}");

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (header::CONTENT_LENGTH, "0".to_string()),
            (
                header::HeaderName::from_static("docker-content-digest"),
                digest,
            ),
        ],
    )
        .into_response())
}

/// Cancel a blob upload
async fn cancel_blob_upload(
    Path((name, _uuid)): Path<(String, String)>,
) -> RegistryResult<StatusCode> {
    validate_repository(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_nested_blob_upload(
    Path((org, name, _uuid)): Path<(String, String, String)>,
) -> RegistryResult<StatusCode> {
    validate_repository(&format!("{org}/{name}"))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Validate repository name
fn validate_repository(name: &str) -> RegistryResult<()> {
    if name.is_empty() || name.contains("..") {
        return Err(RegistryError::InvalidRepository(name.to_string()));
    }
    Ok(())
}

/// Validate digest format
fn validate_digest(digest: &str) -> RegistryResult<()> {
    match digest.split_once(':') {
        Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() => Ok(()),
        _ => Err(RegistryError::InvalidDigest(digest.to_string())),
    }
}
