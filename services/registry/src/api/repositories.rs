//! Repository endpoints: descriptors, tags and the finalize step.

use std::collections::BTreeMap;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, put};
use bytes::Bytes;
use serde::Serialize;

use super::{ApiState, X_DOCKER_ENDPOINTS};
use crate::error::RegistryResult;
use crate::name::RepositoryName;
use crate::service::RequestContext;

/// Router for repository operations
pub(super) fn router() -> Router<ApiState> {
    Router::new()
        .route(
            "/repositories/{namespace}/{repository}",
            put(put_repository),
        )
        .route(
            "/repositories/{namespace}/{repository}/images",
            get(get_images).put(put_images),
        )
        .route("/repositories/{namespace}/{repository}/tags", get(get_tags))
        .route(
            "/repositories/{namespace}/{repository}/tags/{tag}",
            get(get_tag).put(put_tag),
        )
}

#[derive(Debug, Serialize)]
struct ImageEntry {
    id: String,
}

/// Create or update a repository
async fn put_repository(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path((namespace, repository)): Path<(String, String)>,
    body: Bytes,
) -> RegistryResult<Response> {
    let name = RepositoryName::new(namespace, repository)?;
    state.registry.put_repository(&ctx, &name, &body).await?;

    let mut response = Json("").into_response();
    if let Some(endpoints) = state.endpoints {
        response.headers_mut().insert(X_DOCKER_ENDPOINTS, endpoints);
    }
    Ok(response)
}

/// Finalize a push
async fn put_images(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path((namespace, repository)): Path<(String, String)>,
) -> RegistryResult<StatusCode> {
    let name = RepositoryName::new(namespace, repository)?;
    state.registry.finalize(&ctx, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// List the images of a repository
async fn get_images(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path((namespace, repository)): Path<(String, String)>,
) -> RegistryResult<Json<Vec<ImageEntry>>> {
    let name = RepositoryName::new(namespace, repository)?;
    let images = state.registry.repository_images(&ctx, &name).await?;
    Ok(Json(images.into_iter().map(|id| ImageEntry { id }).collect()))
}

/// List the tags of a repository
async fn get_tags(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path((namespace, repository)): Path<(String, String)>,
) -> RegistryResult<Json<BTreeMap<String, String>>> {
    let name = RepositoryName::new(namespace, repository)?;
    Ok(Json(state.registry.repository_tags(&ctx, &name).await?))
}

/// Get the image id of one tag
async fn get_tag(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path((namespace, repository, tag)): Path<(String, String, String)>,
) -> RegistryResult<Json<String>> {
    let name = RepositoryName::new(namespace, repository)?;
    Ok(Json(state.registry.repository_tag(&ctx, &name, &tag).await?))
}

/// Point a tag at an image
async fn put_tag(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path((namespace, repository, tag)): Path<(String, String, String)>,
    body: Bytes,
) -> RegistryResult<Json<&'static str>> {
    let name = RepositoryName::new(namespace, repository)?;
    state.registry.put_tag(&ctx, &name, &tag, &body).await?;
    Ok(Json(""))
}
