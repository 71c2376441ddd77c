use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use skiff_core::compress;
use skiff_core::manifest::{Manifest, ManifestInfo};

use crate::error::ApiError;
use crate::state::AppState;

use super::{decode_manifest, require_auth, tag_filter, ClientIp};

/// GET /api/manifests — list, optionally filtered by `?tag.<k>=<v>`.
pub async fn list(
    State(state): State<AppState>,
    query: Query<BTreeMap<String, String>>,
) -> Result<Json<Vec<ManifestInfo>>, ApiError> {
    let filter = tag_filter(query);
    let storage = state.storage();
    let infos =
        tokio::task::spawn_blocking(move || storage.list_manifests(&filter)).await??;
    Ok(Json(infos))
}

/// GET /api/manifests/latest — newest manifest matching the tag filter.
pub async fn latest(
    State(state): State<AppState>,
    query: Query<BTreeMap<String, String>>,
) -> Result<Json<Manifest>, ApiError> {
    let filter = tag_filter(query);
    let storage = state.storage();
    let blob =
        tokio::task::spawn_blocking(move || storage.get_latest_manifest(&filter)).await??;
    Ok(Json(decode_manifest(&blob)?))
}

/// GET /api/manifests/{id}
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Manifest>, ApiError> {
    let storage = state.storage();
    let blob = tokio::task::spawn_blocking(move || storage.get_manifest(&id)).await??;
    Ok(Json(decode_manifest(&blob)?))
}

/// POST /api/manifests — store a manifest the client finished uploading
/// blocks for. The blob at rest is the JSON compressed with the block
/// compressor.
pub async fn create(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    body: Result<Json<Manifest>, JsonRejection>,
) -> Result<Response, ApiError> {
    require_auth(&state, ip, &headers)?;

    let Json(manifest) =
        body.map_err(|e| ApiError::BadRequest(format!("invalid manifest JSON: {e}")))?;
    if manifest.id.is_empty() {
        return Err(ApiError::BadRequest("manifest id must not be empty".into()));
    }

    let json = serde_json::to_vec(&manifest)
        .map_err(|e| ApiError::Internal(format!("manifest serialize: {e}")))?;
    let blob = compress::compress_prepend_size(&json);

    let storage = state.storage();
    let id = manifest.id.clone();
    tokio::task::spawn_blocking(move || storage.save_manifest(&manifest, &blob)).await??;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": id })),
    )
        .into_response())
}

/// DELETE /api/manifests/{id} — remove one manifest and opportunistically
/// collect any blocks it orphaned.
pub async fn delete_one(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_auth(&state, ip, &headers)?;

    let storage = state.storage();
    let deleted = id.clone();
    tokio::task::spawn_blocking(move || storage.delete_manifest(&id)).await??;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
