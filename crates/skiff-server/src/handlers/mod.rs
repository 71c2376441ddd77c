//! The REST boundary. Handlers parse parameters, invoke the storage
//! engine, and translate engine errors to status codes; nothing here owns
//! business logic.

pub mod blocks;
pub mod download;
pub mod manifests;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{DefaultBodyLimit, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use skiff_core::manifest::Manifest;

use crate::error::ApiError;
use crate::ratelimit::real_ip;
use crate::state::AppState;

/// Uploads carry one 8 MiB chunk plus headroom; manifests can be larger.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(config_info))
        .route(
            "/api/manifests",
            get(manifests::list).post(manifests::create),
        )
        .route("/api/manifests/latest", get(manifests::latest))
        .route(
            "/api/manifests/{id}",
            get(manifests::get_one).delete(manifests::delete_one),
        )
        .route("/api/blocks", post(blocks::upload))
        .route("/api/blocks/{cid}", get(blocks::get_block))
        .route("/api/blocks/{cid}/exists", post(blocks::exists))
        .route("/api/download/{id}", get(download::archive))
        .route("/api/download/{id}/file/{*path}", get(download::file))
        .route("/api/download/{id}/folder/{*path}", get(download::folder))
        .route("/cli/{os}/{arch}", get(download::cli_binary))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn config_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "title": state.inner.config.ui_title }))
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// The source IP for rate limiting: first trustworthy forwarding header,
/// else the socket peer. Falls back to loopback when the listener did not
/// record peer addresses.
pub struct ClientIp(pub IpAddr);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Ok(ClientIp(real_ip(&parts.headers, peer)))
    }
}

/// Bearer-token check for mutating endpoints.
///
/// Blocked IPs short-circuit with 429 before the token is even looked at;
/// the comparison itself is constant-time; every failure blocks the source
/// IP for the configured window.
pub fn require_auth(state: &AppState, ip: IpAddr, headers: &HeaderMap) -> Result<(), ApiError> {
    let limiter = &state.inner.rate_limiter;
    if limiter.is_blocked(ip) {
        limiter.log_failure(ip, "ip temporarily blocked", true);
        return Err(ApiError::RateLimited);
    }

    let provided = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    let expected = state.inner.config.token.as_bytes();

    if bool::from(provided.as_bytes().ct_eq(expected)) {
        Ok(())
    } else {
        limiter.log_failure(ip, "invalid or missing token", false);
        limiter.block(ip);
        Err(ApiError::Unauthorized("invalid or missing token".into()))
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Extract `tag.<k>=<v>` filter pairs from the query string.
pub fn tag_filter(Query(params): Query<BTreeMap<String, String>>) -> BTreeMap<String, String> {
    params
        .into_iter()
        .filter_map(|(k, v)| k.strip_prefix("tag.").map(|name| (name.to_string(), v)))
        .collect()
}

/// Decode a stored manifest blob back into the wire model.
pub fn decode_manifest(blob: &[u8]) -> Result<Manifest, ApiError> {
    let json = skiff_core::compress::decompress_size_prepended(blob)
        .map_err(|e| ApiError::Internal(format!("manifest decompress: {e}")))?;
    serde_json::from_slice(&json).map_err(|e| ApiError::Internal(format!("manifest parse: {e}")))
}
