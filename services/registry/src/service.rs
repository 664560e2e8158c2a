//! The registry service: one method per protocol step.
//!
//! Each call validates its inputs, asks the access gate, delegates to the
//! image or repository store, and emits an audit event when it changes
//! state. No state is kept between calls; the client sequences the steps.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::access::{AccessGate, Action, Actor, AllowAll, Resource};
use crate::ancestry::AncestryBuilder;
use crate::audit::{AuditAction, AuditEvent, AuditSink, TracingAuditSink};
use crate::checksum::Checksum;
use crate::error::{RegistryError, RegistryResult};
use crate::image::{ImageRecord, Images};
use crate::metadata::ImageMetadata;
use crate::name::{RepositoryName, validate_image_id, validate_tag};
use crate::repository::{Repositories, RepositoryRecord};
use crate::storage::RegistryStorage;

/// Header names whose values are never copied into audit events.
const REDACTED_HEADERS: &[&str] = &["authorization", "cookie", "proxy-authorization"];

/// Who is calling, and the request headers to record in audit events.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    actor: Actor,
    headers: BTreeMap<String, Vec<String>>,
}

impl RequestContext {
    /// A context for `actor` with no headers.
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            headers: BTreeMap::new(),
        }
    }

    /// Record a request header. Credential headers are redacted.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.add_header(name, value);
        self
    }

    /// Record a request header. Credential headers are redacted.
    pub fn add_header(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        let value = if REDACTED_HEADERS.contains(&name.as_str()) {
            "<redacted>".to_string()
        } else {
            value.to_string()
        };
        self.headers.entry(name).or_default().push(value);
    }

    /// The calling actor.
    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// The recorded headers as a JSON object of name to list of values.
    pub fn headers_json(&self) -> String {
        serde_json::to_string(&self.headers).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Image metadata ready to be served to a pulling client.
#[derive(Debug, Clone)]
pub struct ImageJson {
    /// The metadata exactly as pushed
    pub json: Bytes,
    /// The verified layer checksum
    pub checksum: Checksum,
    /// The layer size in bytes
    pub size: u64,
}

/// Parse the body of a tag push: a JSON string holding the image id.
///
/// A bare id without quotes is accepted as well.
pub fn parse_tag_body(body: &[u8]) -> RegistryResult<String> {
    let id = match serde_json::from_slice::<String>(body) {
        Ok(id) => id,
        Err(_) => std::str::from_utf8(body)
            .map_err(|_| RegistryError::InvalidImageId("tag body is not UTF-8".into()))?
            .trim()
            .to_string(),
    };
    validate_image_id(&id)?;
    Ok(id)
}

/// The registry orchestrator.
#[derive(Clone)]
pub struct Registry {
    images: Images,
    repositories: Repositories,
    gate: Arc<dyn AccessGate>,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("images", &self.images)
            .field("repositories", &self.repositories)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Create a registry which allows every request and audits to `tracing`.
    pub fn new(storage: RegistryStorage) -> Self {
        Self::with_parts(
            storage,
            AncestryBuilder::default(),
            Arc::new(AllowAll),
            Arc::new(TracingAuditSink),
        )
    }

    /// Create a registry from its collaborators.
    pub fn with_parts(
        storage: RegistryStorage,
        ancestry: AncestryBuilder,
        gate: Arc<dyn AccessGate>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let images = Images::new(storage.clone(), ancestry);
        let repositories = Repositories::new(storage, images.clone());
        Self {
            images,
            repositories,
            gate,
            audit,
        }
    }

    /// The image store
    pub fn images(&self) -> &Images {
        &self.images
    }

    /// The repository store
    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    fn authorize(
        &self,
        ctx: &RequestContext,
        action: Action,
        resource: Resource<'_>,
    ) -> RegistryResult<()> {
        if self.gate.allows(ctx.actor(), action, &resource) {
            Ok(())
        } else {
            Err(RegistryError::Denied(resource.to_string()))
        }
    }

    /// Audit a successful mutation, and log a failed one.
    async fn finish<T>(
        &self,
        ctx: &RequestContext,
        action: AuditAction,
        entity: &str,
        result: RegistryResult<T>,
    ) -> RegistryResult<T> {
        match result {
            Ok(value) => {
                let event = AuditEvent::new(action, ctx.actor(), entity, ctx.headers_json());
                if let Err(error) = self.audit.record(event).await {
                    tracing::warn!(%error, action = action.as_str(), "failed to record audit event");
                }
                Ok(value)
            }
            Err(error) => Err(observe(error)),
        }
    }

    /// Store the metadata JSON of an image.
    #[tracing::instrument(skip(self, ctx, body), fields(actor = %ctx.actor()))]
    pub async fn put_image_json(
        &self,
        ctx: &RequestContext,
        id: &str,
        body: Bytes,
    ) -> RegistryResult<ImageRecord> {
        let result = async {
            validate_image_id(id)?;
            self.authorize(ctx, Action::WriteImage, Resource::Image(id))?;
            let metadata = ImageMetadata::parse(id, body)?;
            self.images.put_json(metadata).await
        }
        .await;
        self.finish(ctx, AuditAction::PutImageJson, id, result).await
    }

    /// Store the layer of an image.
    #[tracing::instrument(skip(self, ctx, body), fields(actor = %ctx.actor(), size = body.len()))]
    pub async fn put_image_layer(
        &self,
        ctx: &RequestContext,
        id: &str,
        body: Bytes,
    ) -> RegistryResult<ImageRecord> {
        let result = async {
            validate_image_id(id)?;
            self.authorize(ctx, Action::WriteImage, Resource::Image(id))?;
            self.images.put_layer(id, body).await
        }
        .await;
        self.finish(ctx, AuditAction::PutImageLayer, id, result).await
    }

    /// Verify the declared layer checksum of an image.
    ///
    /// The payload checksum is validated for format and stored as given.
    #[tracing::instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn put_image_checksum(
        &self,
        ctx: &RequestContext,
        id: &str,
        checksum: Option<&str>,
        payload: Option<&str>,
    ) -> RegistryResult<ImageRecord> {
        let result = async {
            validate_image_id(id)?;
            self.authorize(ctx, Action::WriteImage, Resource::Image(id))?;
            let checksum: Checksum = checksum
                .ok_or_else(|| RegistryError::InvalidChecksumFormat("missing checksum".into()))?
                .parse()?;
            let payload = payload.map(str::parse::<Checksum>).transpose()?;
            self.images.put_checksum(id, checksum, payload).await
        }
        .await;
        self.finish(ctx, AuditAction::PutImageChecksum, id, result)
            .await
    }

    /// Metadata of a pullable image.
    ///
    /// Images which are not yet checksummed are reported as not ready, so a
    /// client probing before a push re-sends a half-pushed image.
    #[tracing::instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn image_json(&self, ctx: &RequestContext, id: &str) -> RegistryResult<ImageJson> {
        let result = async {
            validate_image_id(id)?;
            self.authorize(ctx, Action::ReadImage, Resource::Image(id))?;
            let record = self.images.record(id).await?;
            let (Some(checksum), Some(layer), true) =
                (record.checksum(), record.layer(), record.is_checksummed())
            else {
                return Err(RegistryError::NotReady {
                    image: id.to_string(),
                    missing: "checksum",
                });
            };
            Ok::<_, RegistryError>(ImageJson {
                json: self.images.get_json(id).await?,
                checksum: checksum.clone(),
                size: layer.size,
            })
        }
        .await;
        result.map_err(observe)
    }

    /// Layer bytes of an image.
    #[tracing::instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn image_layer(&self, ctx: &RequestContext, id: &str) -> RegistryResult<Bytes> {
        let result = async {
            validate_image_id(id)?;
            self.authorize(ctx, Action::ReadImage, Resource::Image(id))?;
            self.images.get_layer(id).await
        }
        .await;
        result.map_err(observe)
    }

    /// Ancestry of an image, self first.
    #[tracing::instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn image_ancestry(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> RegistryResult<Vec<String>> {
        let result = async {
            validate_image_id(id)?;
            self.authorize(ctx, Action::ReadImage, Resource::Image(id))?;
            self.images.get_ancestry(id).await
        }
        .await;
        result.map_err(observe)
    }

    /// Create or update a repository from its descriptor.
    #[tracing::instrument(skip(self, ctx, body), fields(actor = %ctx.actor(), repository = %name))]
    pub async fn put_repository(
        &self,
        ctx: &RequestContext,
        name: &RepositoryName,
        body: &[u8],
    ) -> RegistryResult<RepositoryRecord> {
        let result = async {
            self.authorize(ctx, Action::WriteRepository, Resource::Repository(name))?;
            self.repositories.create_or_update(name, body).await
        }
        .await;
        self.finish(ctx, AuditAction::PutRepository, &name.to_string(), result)
            .await
    }

    /// Point a tag at the image id held in `body`.
    #[tracing::instrument(skip(self, ctx, body), fields(actor = %ctx.actor(), repository = %name))]
    pub async fn put_tag(
        &self,
        ctx: &RequestContext,
        name: &RepositoryName,
        tag: &str,
        body: &[u8],
    ) -> RegistryResult<String> {
        let result = async {
            validate_tag(tag)?;
            self.authorize(ctx, Action::WriteRepository, Resource::Repository(name))?;
            let image_id = parse_tag_body(body)?;
            self.repositories.put_tag(name, tag, &image_id).await?;
            Ok::<_, RegistryError>(image_id)
        }
        .await;
        self.finish(ctx, AuditAction::PutTag, &format!("{name}:{tag}"), result)
            .await
    }

    /// Finalize a push of a repository.
    #[tracing::instrument(skip(self, ctx), fields(actor = %ctx.actor(), repository = %name))]
    pub async fn finalize(
        &self,
        ctx: &RequestContext,
        name: &RepositoryName,
    ) -> RegistryResult<RepositoryRecord> {
        let result = async {
            self.authorize(ctx, Action::WriteRepository, Resource::Repository(name))?;
            self.repositories.finalize(name).await
        }
        .await;
        self.finish(
            ctx,
            AuditAction::PutRepositoryImages,
            &name.to_string(),
            result,
        )
        .await
    }

    /// Images of a repository, in the order they were first pushed.
    #[tracing::instrument(skip(self, ctx), fields(actor = %ctx.actor(), repository = %name))]
    pub async fn repository_images(
        &self,
        ctx: &RequestContext,
        name: &RepositoryName,
    ) -> RegistryResult<Vec<String>> {
        let result = async {
            self.authorize(ctx, Action::ReadRepository, Resource::Repository(name))?;
            self.repositories.get_images(name).await
        }
        .await;
        result.map_err(observe)
    }

    /// Tags of a repository.
    #[tracing::instrument(skip(self, ctx), fields(actor = %ctx.actor(), repository = %name))]
    pub async fn repository_tags(
        &self,
        ctx: &RequestContext,
        name: &RepositoryName,
    ) -> RegistryResult<BTreeMap<String, String>> {
        let result = async {
            self.authorize(ctx, Action::ReadRepository, Resource::Repository(name))?;
            self.repositories.get_tags(name).await
        }
        .await;
        result.map_err(observe)
    }

    /// The image id of one tag.
    #[tracing::instrument(skip(self, ctx), fields(actor = %ctx.actor(), repository = %name))]
    pub async fn repository_tag(
        &self,
        ctx: &RequestContext,
        name: &RepositoryName,
        tag: &str,
    ) -> RegistryResult<String> {
        let result = async {
            validate_tag(tag)?;
            self.authorize(ctx, Action::ReadRepository, Resource::Repository(name))?;
            self.repositories.get_tag(name, tag).await
        }
        .await;
        result.map_err(observe)
    }
}

/// Log a failed call, with whether the client can recover by retrying.
fn observe(error: RegistryError) -> RegistryError {
    if error.is_internal() {
        tracing::error!(%error, "registry operation failed");
    } else {
        tracing::warn!(%error, retryable = error.is_retryable(), "registry request rejected");
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditError, MemoryAuditSink};
    use storage::MemoryStorage;

    fn registry(audit: Arc<dyn AuditSink>) -> Registry {
        let storage: storage::Storage = MemoryStorage::with_buckets(&["test"]).into();
        Registry::with_parts(
            RegistryStorage::new(storage, "test"),
            AncestryBuilder::default(),
            Arc::new(AllowAll),
            audit,
        )
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Actor::new("ci"))
            .with_header("Authorization", "Basic Y2k6c2VjcmV0")
            .with_header("User-Agent", "docker/1.0")
    }

    fn name() -> RepositoryName {
        RepositoryName::new("library", "busybox").unwrap()
    }

    async fn push_image(registry: &Registry, id: &str, layer: &'static [u8]) {
        let json = Bytes::from(serde_json::json!({ "id": id }).to_string());
        registry.put_image_json(&ctx(), id, json).await.unwrap();
        registry
            .put_image_layer(&ctx(), id, Bytes::from_static(layer))
            .await
            .unwrap();
        let checksum = Checksum::sha256(layer).to_string();
        registry
            .put_image_checksum(&ctx(), id, Some(&checksum), Some(&checksum))
            .await
            .unwrap();
    }

    #[test]
    fn test_parse_tag_body() {
        assert_eq!(parse_tag_body(br#""abc123""#).unwrap(), "abc123");
        assert_eq!(parse_tag_body(b"abc123\n").unwrap(), "abc123");
        assert!(parse_tag_body(br#"{"id":"abc"}"#).is_err());
        assert!(parse_tag_body(b"").is_err());
    }

    #[test]
    fn test_headers_are_redacted() {
        let json: serde_json::Value = serde_json::from_str(&ctx().headers_json()).unwrap();
        assert_eq!(json["authorization"], serde_json::json!(["<redacted>"]));
        assert_eq!(json["user-agent"], serde_json::json!(["docker/1.0"]));
    }

    #[tokio::test]
    async fn test_full_push_is_audited() {
        let audit = MemoryAuditSink::new();
        let registry = registry(Arc::new(audit.clone()));

        registry
            .put_repository(&ctx(), &name(), br#"[{"id":"a"}]"#)
            .await
            .unwrap();
        push_image(&registry, "a", b"layer").await;
        registry
            .put_tag(&ctx(), &name(), "latest", br#""a""#)
            .await
            .unwrap();
        let record = registry.finalize(&ctx(), &name()).await.unwrap();
        assert!(record.upload_completed());

        let actions: Vec<_> = audit.events().iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::PutRepository,
                AuditAction::PutImageJson,
                AuditAction::PutImageLayer,
                AuditAction::PutImageChecksum,
                AuditAction::PutTag,
                AuditAction::PutRepositoryImages,
            ]
        );
        let events = audit.events();
        assert!(events.iter().all(|e| e.actor == "ci"));
        assert!(events.iter().all(|e| !e.headers.contains("Y2k6c2VjcmV0")));
        assert_eq!(events[4].entity, "library/busybox:latest");

        let json = registry.image_json(&ctx(), "a").await.unwrap();
        assert_eq!(json.size, 5);
        assert_eq!(json.checksum, Checksum::sha256(b"layer"));
        assert_eq!(
            registry.repository_tags(&ctx(), &name()).await.unwrap(),
            BTreeMap::from([("latest".to_string(), "a".to_string())])
        );
    }

    #[tokio::test]
    async fn test_failed_steps_are_not_audited() {
        let audit = MemoryAuditSink::new();
        let registry = registry(Arc::new(audit.clone()));

        let err = registry
            .put_image_json(&ctx(), "a", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidMetadata(_)));

        let err = registry
            .put_image_checksum(&ctx(), "a", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidChecksumFormat(_)));

        assert!(audit.events().is_empty());
    }

    #[derive(Debug)]
    struct FailingSink;

    #[async_trait::async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
            Err(AuditError::new("failing", "disk full"))
        }
    }

    #[tokio::test]
    async fn test_audit_failures_do_not_fail_requests() {
        let registry = registry(Arc::new(FailingSink));
        push_image(&registry, "a", b"layer").await;
        assert_eq!(
            registry.image_ancestry(&ctx(), "a").await.unwrap(),
            vec!["a"]
        );
    }

    #[tokio::test]
    async fn test_event_is_recorded_before_reply() {
        let audit = MemoryAuditSink::new();
        let registry = registry(Arc::new(audit.clone()));

        registry
            .put_image_json(&ctx(), "a", Bytes::from_static(br#"{"id":"a"}"#))
            .await
            .unwrap();
        assert_eq!(audit.events().len(), 1);

        registry
            .put_image_layer(&ctx(), "a", Bytes::from_static(b"layer"))
            .await
            .unwrap();
        let events = audit.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action, AuditAction::PutImageLayer);
        assert_eq!(events[1].entity, "a");
    }

    #[tokio::test]
    async fn test_image_json_requires_checksum() {
        let registry = registry(Arc::new(MemoryAuditSink::new()));
        let json = Bytes::from_static(br#"{"id":"a"}"#);
        registry.put_image_json(&ctx(), "a", json).await.unwrap();

        let err = registry.image_json(&ctx(), "a").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotReady { .. }));

        let err = registry.image_json(&ctx(), "b").await.unwrap_err();
        assert!(matches!(err, RegistryError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn test_gate_is_consulted() {
        let storage: storage::Storage = MemoryStorage::with_buckets(&["test"]).into();
        let audit = MemoryAuditSink::new();
        let registry = Registry::with_parts(
            RegistryStorage::new(storage, "test"),
            AncestryBuilder::default(),
            Arc::new(crate::access::ReadOnlyAnonymous),
            Arc::new(audit.clone()),
        );

        let anonymous = RequestContext::default();
        let err = registry
            .put_repository(&anonymous, &name(), b"[]")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Denied(_)));

        let err = registry
            .repository_tags(&anonymous, &name())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::RepositoryNotFound(_)));
        assert!(audit.events().is_empty());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_then_retry() {
        let registry = registry(Arc::new(MemoryAuditSink::new()));
        let json = Bytes::from_static(br#"{"id":"a"}"#);
        registry.put_image_json(&ctx(), "a", json).await.unwrap();
        registry
            .put_image_layer(&ctx(), "a", Bytes::from_static(b"truncated"))
            .await
            .unwrap();

        let declared = Checksum::sha256(b"complete layer").to_string();
        let err = registry
            .put_image_checksum(&ctx(), "a", Some(&declared), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        registry
            .put_image_layer(&ctx(), "a", Bytes::from_static(b"complete layer"))
            .await
            .unwrap();
        let record = registry
            .put_image_checksum(&ctx(), "a", Some(&declared), None)
            .await
            .unwrap();
        assert!(record.is_checksummed());
    }
}
