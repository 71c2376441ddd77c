use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use skiff_core::{cid, compress};

use crate::error::ApiError;
use crate::state::AppState;

use super::{require_auth, ClientIp};

/// GET /api/blocks/{cid} — the raw stored (possibly compressed) block.
/// `X-Original-Size` lets callers decompress without guessing.
pub async fn get_block(
    State(state): State<AppState>,
    Path(block_cid): Path<String>,
) -> Result<Response, ApiError> {
    if !cid::validate(&block_cid) {
        return Err(ApiError::BadRequest(format!("malformed CID: {block_cid}")));
    }

    let storage = state.storage();
    let block =
        tokio::task::spawn_blocking(move || storage.get_block(&block_cid)).await??;

    Ok((
        StatusCode::OK,
        [
            ("Content-Type", "application/octet-stream".to_string()),
            ("X-Original-Size", block.original_size.to_string()),
        ],
        block.data,
    )
        .into_response())
}

/// POST /api/blocks/{cid}/exists — the dedup probe. 200 when present, 404
/// when absent. POST is the protocol contract existing clients rely on.
pub async fn exists(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Path(block_cid): Path<String>,
) -> Result<Response, ApiError> {
    require_auth(&state, ip, &headers)?;

    if !cid::validate(&block_cid) {
        return Err(ApiError::BadRequest(format!("malformed CID: {block_cid}")));
    }

    let storage = state.storage();
    let present =
        tokio::task::spawn_blocking(move || storage.block_exists(&block_cid)).await??;

    let status = if present {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((status, Json(serde_json::json!({ "exists": present }))).into_response())
}

/// POST /api/blocks — upload one block. `X-Block-CID` names it,
/// `X-Original-Size` is the uncompressed length, the body is the stored
/// (possibly compressed) bytes.
///
/// The CID is recomputed from the decompressed body before anything is
/// persisted; a mismatch is rejected so a corrupt upload can never become
/// addressable content.
pub async fn upload(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_auth(&state, ip, &headers)?;

    let block_cid = headers
        .get("X-Block-CID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("missing X-Block-CID header".into()))?;
    if !cid::validate(&block_cid) {
        return Err(ApiError::BadRequest(format!("malformed CID: {block_cid}")));
    }

    let original_size: u64 = headers
        .get("X-Original-Size")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError::BadRequest("missing or invalid X-Original-Size header".into()))?;

    let plain = compress::decompress(&body, original_size as usize)
        .map_err(|e| ApiError::BadRequest(format!("block does not decompress: {e}")))?;
    let computed = cid::generate(&plain);
    if computed != block_cid {
        return Err(ApiError::BadRequest(format!(
            "content does not match CID: declared {block_cid}, computed {computed}"
        )));
    }

    let storage = state.storage();
    let saved_cid = block_cid.clone();
    tokio::task::spawn_blocking(move || {
        storage.save_block(&saved_cid, &body, original_size)
    })
    .await??;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "cid": block_cid })),
    )
        .into_response())
}
