//! Image endpoints: metadata, layers, checksums and ancestry.

use axum::Router;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, put};
use bytes::Bytes;

use super::{
    ApiState, X_CHECKSUM, X_CHECKSUM_PAYLOAD, X_DOCKER_CHECKSUM, X_DOCKER_CHECKSUM_PAYLOAD,
    X_DOCKER_SIZE,
};
use crate::error::RegistryResult;
use crate::service::RequestContext;

/// Router for image operations
pub(super) fn router() -> Router<ApiState> {
    Router::new()
        .route("/images/{image_id}/json", get(get_json).put(put_json))
        .route(
            "/images/{image_id}/layer",
            get(get_layer)
                .put(put_layer)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/images/{image_id}/checksum", put(put_checksum))
        .route("/images/{image_id}/ancestry", get(get_ancestry))
}

/// Get image metadata, with the layer checksum and size in headers
async fn get_json(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(image_id): Path<String>,
) -> RegistryResult<Response> {
    let image = state.registry.image_json(&ctx, &image_id).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (X_DOCKER_CHECKSUM, image.checksum.to_string()),
            (X_DOCKER_SIZE, image.size.to_string()),
        ],
        image.json,
    )
        .into_response())
}

/// Register image metadata
async fn put_json(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(image_id): Path<String>,
    body: Bytes,
) -> RegistryResult<Json<&'static str>> {
    state.registry.put_image_json(&ctx, &image_id, body).await?;
    Ok(Json(""))
}

/// Download layer bytes
async fn get_layer(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(image_id): Path<String>,
) -> RegistryResult<Response> {
    let layer = state.registry.image_layer(&ctx, &image_id).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                HeaderName::from_static("content-transfer-encoding"),
                "binary".to_string(),
            ),
            (header::CONTENT_LENGTH, layer.len().to_string()),
        ],
        layer,
    )
        .into_response())
}

/// Upload layer bytes
async fn put_layer(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(image_id): Path<String>,
    body: Bytes,
) -> RegistryResult<Json<&'static str>> {
    state.registry.put_image_layer(&ctx, &image_id, body).await?;
    Ok(Json(""))
}

fn header_str<'h>(headers: &'h HeaderMap, names: &[HeaderName]) -> Option<&'h str> {
    names
        .iter()
        .find_map(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
}

/// Submit the layer checksum
async fn put_checksum(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(image_id): Path<String>,
    headers: HeaderMap,
) -> RegistryResult<Json<&'static str>> {
    let checksum = header_str(&headers, &[X_DOCKER_CHECKSUM, X_CHECKSUM]);
    let payload = header_str(&headers, &[X_DOCKER_CHECKSUM_PAYLOAD, X_CHECKSUM_PAYLOAD]);

    state
        .registry
        .put_image_checksum(&ctx, &image_id, checksum, payload)
        .await?;
    Ok(Json(""))
}

/// Get the ancestry of an image, self first
async fn get_ancestry(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(image_id): Path<String>,
) -> RegistryResult<Json<Vec<String>>> {
    Ok(Json(state.registry.image_ancestry(&ctx, &image_id).await?))
}
