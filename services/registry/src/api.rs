//! API server builder and router

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use axum::Router;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::Json;
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::access::{AccessGate, Actor, AllowAll};
use crate::ancestry::{AncestryBuilder, DEFAULT_MAX_DEPTH};
use crate::audit::{AuditSink, TracingAuditSink};
use crate::service::{Registry, RequestContext};
use crate::storage::RegistryStorage;

mod images;
mod repositories;

/// Protocol version advertised in `X-Docker-Registry-Version`.
pub const REGISTRY_VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) const X_DOCKER_REGISTRY_VERSION: HeaderName =
    HeaderName::from_static("x-docker-registry-version");
pub(crate) const X_DOCKER_REGISTRY_STANDALONE: HeaderName =
    HeaderName::from_static("x-docker-registry-standalone");
pub(crate) const X_DOCKER_REGISTRY_CONFIG: HeaderName =
    HeaderName::from_static("x-docker-registry-config");
pub(crate) const X_DOCKER_ENDPOINTS: HeaderName = HeaderName::from_static("x-docker-endpoints");
pub(crate) const X_DOCKER_CHECKSUM: HeaderName = HeaderName::from_static("x-docker-checksum");
pub(crate) const X_DOCKER_CHECKSUM_PAYLOAD: HeaderName =
    HeaderName::from_static("x-docker-checksum-payload");
pub(crate) const X_DOCKER_SIZE: HeaderName = HeaderName::from_static("x-docker-size");
pub(crate) const X_CHECKSUM: HeaderName = HeaderName::from_static("x-checksum");
pub(crate) const X_CHECKSUM_PAYLOAD: HeaderName = HeaderName::from_static("x-checksum-payload");

/// State shared by all request handlers.
#[derive(Debug, Clone)]
pub(crate) struct ApiState {
    pub(crate) registry: Registry,
    pub(crate) endpoints: Option<HeaderValue>,
}

/// Registry builder for configuring and creating the registry service
pub struct RegistryBuilder {
    storage: storage::Storage,
    bucket: Option<String>,
    gate: Arc<dyn AccessGate>,
    audit: Arc<dyn AuditSink>,
    max_ancestry_depth: usize,
    standalone: bool,
    endpoints: Option<String>,
    config_name: String,
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("storage", &self.storage)
            .field("bucket", &self.bucket)
            .field("max_ancestry_depth", &self.max_ancestry_depth)
            .field("standalone", &self.standalone)
            .field("endpoints", &self.endpoints)
            .field("config_name", &self.config_name)
            .finish_non_exhaustive()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder on top of a storage backend
    pub fn new(storage: storage::Storage) -> Self {
        Self {
            storage,
            bucket: None,
            gate: Arc::new(AllowAll),
            audit: Arc::new(TracingAuditSink),
            max_ancestry_depth: DEFAULT_MAX_DEPTH,
            standalone: true,
            endpoints: None,
            config_name: "common".to_string(),
        }
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the gate which authorizes requests
    pub fn access_gate<G: AccessGate + 'static>(mut self, gate: G) -> Self {
        self.gate = Arc::new(gate);
        self
    }

    /// Set the sink which receives audit events
    pub fn audit_sink<S: AuditSink + 'static>(mut self, sink: S) -> Self {
        self.audit = Arc::new(sink);
        self
    }

    /// Bound the length of image ancestries
    pub fn max_ancestry_depth(mut self, depth: usize) -> Self {
        self.max_ancestry_depth = depth;
        self
    }

    /// Whether to advertise this registry as standalone (no separate index)
    pub fn standalone(mut self, standalone: bool) -> Self {
        self.standalone = standalone;
        self
    }

    /// Value returned in `X-Docker-Endpoints` when a repository is pushed
    pub fn endpoints(mut self, endpoints: impl Into<String>) -> Self {
        self.endpoints = Some(endpoints.into());
        self
    }

    /// Value returned in `X-Docker-Registry-Config`
    pub fn config_name(mut self, name: impl Into<String>) -> Self {
        self.config_name = name.into();
        self
    }

    /// Build the transport-independent registry service
    pub fn build_service(&self) -> Registry {
        let bucket = self.bucket.as_deref().unwrap_or("registry");
        Registry::with_parts(
            RegistryStorage::new(self.storage.clone(), bucket),
            AncestryBuilder::new(self.max_ancestry_depth),
            self.gate.clone(),
            self.audit.clone(),
        )
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let registry = self.build_service();

        let endpoints = self
            .endpoints
            .as_deref()
            .and_then(|endpoints| match HeaderValue::from_str(endpoints) {
                Ok(value) => Some(value),
                Err(error) => {
                    tracing::warn!(%error, "ignoring invalid endpoints header value");
                    None
                }
            });
        let config_name = HeaderValue::from_str(&self.config_name).unwrap_or_else(|error| {
            tracing::warn!(%error, "invalid registry config name, using `common`");
            HeaderValue::from_static("common")
        });
        let standalone = HeaderValue::from_static(if self.standalone { "true" } else { "false" });

        let state = ApiState {
            registry,
            endpoints,
        };

        let v1 = Router::new()
            .route("/_ping", get(ping))
            .merge(images::router())
            .merge(repositories::router());

        Router::new()
            .route("/_ping", get(ping))
            .nest("/v1", v1)
            .with_state(state)
            .layer(SetResponseHeaderLayer::overriding(
                X_DOCKER_REGISTRY_VERSION,
                HeaderValue::from_static(REGISTRY_VERSION),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                X_DOCKER_REGISTRY_STANDALONE,
                standalone,
            ))
            .layer(SetResponseHeaderLayer::overriding(
                X_DOCKER_REGISTRY_CONFIG,
                config_name,
            ))
            .layer(TraceLayer::new_for_http())
    }
}

/// Ping endpoint
///
/// Clients probe this before pushing or pulling.
async fn ping() -> Json<bool> {
    Json(true)
}

/// The user name of a `Basic` authorization header.
///
/// Only the name is decoded. Checking the password is up to the access gate.
fn basic_auth_user(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credentials) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(credentials.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let user = decoded.split_once(':').map_or(decoded.as_str(), |(user, _)| user);
    (!user.is_empty()).then(|| user.to_string())
}

pub(crate) fn request_context(headers: &HeaderMap) -> RequestContext {
    let actor = basic_auth_user(headers)
        .map(Actor::new)
        .unwrap_or_default();

    let mut ctx = RequestContext::new(actor);
    for (name, value) in headers {
        ctx.add_header(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
    }
    ctx
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(request_context(&parts.headers))
    }
}
