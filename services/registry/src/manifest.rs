//! Manifest operations for the registry
//!
//! Repository names may be flat (`app`) or namespaced (`org/app`), so each
//! endpoint is mounted for both shapes. Push and delete routes are only
//! mounted when the registry is writable.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;

use crate::error::{RegistryError, RegistryResult};
use crate::storage::RegistryStorage;

/// Router for manifest operations
pub fn router(read_only: bool) -> Router<RegistryStorage> {
    let mut manifests = get(get_manifest).head(head_manifest);
    let mut nested_manifests = get(get_nested_manifest).head(head_nested_manifest);

    if !read_only {
        manifests = manifests.put(put_manifest).delete(delete_manifest);
        nested_manifests = nested_manifests
            .put(put_nested_manifest)
            .delete(delete_nested_manifest);
    }

    Router::new()
        .route("/v2/{name}/manifests/{reference}", manifests)
        .route("/v2/{name}/{subname}/manifests/{reference}", nested_manifests)
        .route("/v2/{name}/tags/list", get(list_tags))
        .route("/v2/{name}/{subname}/tags/list", get(list_nested_tags))
}

/// Get a manifest
async fn get_manifest(
    State(storage): State<RegistryStorage>,
    Path((name, reference)): Path<(String, String)>,
) -> RegistryResult<Response> {
    fetch_manifest(&storage, &name, &reference, true).await
}

async fn get_nested_manifest(
    State(storage): State<RegistryStorage>,
    Path((org, name, reference)): Path<(String, String, String)>,
) -> RegistryResult<Response> {
    fetch_manifest(&storage, &format!("{org}/{name}"), &reference, true).await
}

/// Check if a manifest exists
async fn head_manifest(
    State(storage): State<RegistryStorage>,
    Path((name, reference)): Path<(String, String)>,
) -> RegistryResult<Response> {
    fetch_manifest(&storage, &name, &reference, false).await
}

async fn head_nested_manifest(
    State(storage): State<RegistryStorage>,
    Path((org, name, reference)): Path<(String, String, String)>,
) -> RegistryResult<Response> {
    fetch_manifest(&storage, &format!("{org}/{name}"), &reference, false).await
}

/// Shared body of GET and HEAD; HEAD returns the same headers without the
/// payload.
async fn fetch_manifest(
    storage: &RegistryStorage,
    name: &str,
    reference: &str,
    include_body: bool,
) -> RegistryResult<Response> {
    validate_repository(name)?;

    let (digest, data) = storage.get_manifest(name, reference).await?;
    let content_type = detect_manifest_type(&data);

    let headers = [
        (header::CONTENT_TYPE, content_type),
        (
            header::HeaderName::from_static("docker-content-digest"),
            digest,
        ),
        (header::CONTENT_LENGTH, data.len().to_string()),
    ];

    if include_body {
        Ok((StatusCode::OK, headers, data).into_response())
    } else {
        Ok((StatusCode::OK, headers).into_response())
    }
}

/// Put a manifest
async fn put_manifest(
    State(storage): State<RegistryStorage>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    store_manifest(&storage, &name, &reference, &headers, &body).await
}

async fn put_nested_manifest(
    State(storage): State<RegistryStorage>,
    Path((org, name, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    store_manifest(&storage, &format!("{org}/{name}"), &reference, &headers, &body).await
}

async fn store_manifest(
    storage: &RegistryStorage,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> RegistryResult<Response> {
    validate_repository(name)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/vnd.docker.distribution.manifest.v2+json");
    validate_manifest_type(content_type)?;

    let digest = storage.put_manifest(name, reference, body).await?;
    let location = format!("/v2/{name}/manifests/{digest}");

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (
                header::HeaderName::from_static("docker-content-digest"),
                digest,
            ),
        ],
    )
        .into_response())
}

/// Delete a manifest
async fn delete_manifest(
    State(storage): State<RegistryStorage>,
    Path((name, reference)): Path<(String, String)>,
) -> RegistryResult<StatusCode> {
    validate_repository(&name)?;
    storage.delete_manifest(&name, &reference).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn delete_nested_manifest(
    State(storage): State<RegistryStorage>,
    Path((org, name, reference)): Path<(String, String, String)>,
) -> RegistryResult<StatusCode> {
    let name = format!("{org}/{name}");
    validate_repository(&name)?;
    storage.delete_manifest(&name, &reference).await?;
    Ok(StatusCode::ACCEPTED)
}

/// List tags for a repository
async fn list_tags(
    State(storage): State<RegistryStorage>,
    Path(name): Path<String>,
) -> RegistryResult<Json<TagList>> {
    validate_repository(&name)?;
    let tags = storage.list_tags(&name).await?;
    Ok(Json(TagList { name, tags }))
}

async fn list_nested_tags(
    State(storage): State<RegistryStorage>,
    Path((org, name)): Path<(String, String)>,
) -> RegistryResult<Json<TagList>> {
    let name = format!("{org}/{name}");
    validate_repository(&name)?;
    let tags = storage.list_tags(&name).await?;
    Ok(Json(TagList { name, tags }))
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

/// Validate repository name
fn validate_repository(name: &str) -> RegistryResult<()> {
    if name.is_empty() || name.contains("..") {
        return Err(RegistryError::InvalidRepository(name.to_string()));
    }
    Ok(())
}

/// Detect manifest type from content
fn detect_manifest_type(data: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) {
        if let Some(media_type) = json.get("mediaType").and_then(|v| v.as_str()) {
            return media_type.to_string();
        }

        if let Some(schema_version) = json.get("schemaVersion").and_then(|v| v.as_u64()) {
            return match schema_version {
                1 => "application/vnd.docker.distribution.manifest.v1+json".to_string(),
                2 => {
                    if json.get("manifests").is_some() {
                        "application/vnd.docker.distribution.manifest.list.v2+json".to_string()
                    } else {
                        "application/vnd.docker.distribution.manifest.v2+json".to_string()
                    }
                }
                _ => "application/vnd.oci.image.manifest.v1+json".to_string(),
            };
        }
    }

    "application/vnd.oci.image.manifest.v1+json".to_string()
}

/// Validate manifest type
fn validate_manifest_type(content_type: &str) -> RegistryResult<()> {
    match content_type {
        "application/vnd.docker.distribution.manifest.v1+json"
        | "application/vnd.docker.distribution.manifest.v1+prettyjws"
        | "application/vnd.docker.distribution.manifest.v2+json"
        | "application/vnd.docker.distribution.manifest.list.v2+json"
        | "application/vnd.oci.image.manifest.v1+json"
        | "application/vnd.oci.image.index.v1+json" => Ok(()),
        _ => Err(RegistryError::UnsupportedManifestType(
            content_type.to_string(),
        )),
    }
}
