use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes storage errors by what the caller should do about them,
/// independent of the backend that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested object or bucket does not exist.
    NotFound,

    /// The backend refused the operation.
    PermissionDenied,

    /// Reading or writing failed part way (disk, network, ...).
    ///
    /// The object may be missing or incomplete; repeating the operation is
    /// the expected recovery.
    Io,

    /// The request itself was invalid (bad path, bad configuration, ...).
    InvalidRequest,

    /// Anything else.
    Other,
}

impl StorageErrorKind {
    /// Whether repeating the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorKind::Io)
    }

    fn from_io(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            std::io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
            _ => StorageErrorKind::Io,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

/// Storage error with operation context.
///
/// Carries the semantic [`StorageErrorKind`], the engine which produced the
/// error, the bucket and path when known, and the tracing span context at the
/// point the error was created.
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "local",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
/// )
/// .bucket("registry")
/// .path("images/abc/layer")
/// .build();
///
/// assert!(error.is_not_found());
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    span_trace: Box<SpanTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::builder(engine, kind, error).build()
    }

    /// Create a storage error from an I/O error, deriving the kind from the
    /// I/O error kind.
    pub fn io(engine: &'static str, error: std::io::Error) -> Self {
        let kind = StorageErrorKind::from_io(error.kind());
        Self::new(engine, kind, error)
    }

    /// Create a "not found" error for an object in a bucket.
    pub fn not_found(engine: &'static str, bucket: &str, path: Option<&str>) -> Self {
        let (message, builder_path) = match path {
            Some(path) => (format!("path not found: {bucket}/{path}"), Some(path)),
            None => (format!("bucket not found: {bucket}"), None),
        };

        let mut builder = Self::builder(
            engine,
            StorageErrorKind::NotFound,
            std::io::Error::new(std::io::ErrorKind::NotFound, message),
        )
        .bucket(bucket);
        if let Some(path) = builder_path {
            builder = builder.path(path);
        }
        builder.build()
    }

    /// Create a builder for a storage error with full context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            bucket: None,
            path: None,
            context: None,
        }
    }

    /// Returns a boxed closure that creates a storage error from a downstream error,
    /// for use with `.map_err()`.
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Whether the error means the object (or bucket) does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the bucket name, if available.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Returns the object path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns the span trace captured when this error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(bucket) = &self.bucket {
            write!(f, " (bucket: {})", bucket)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for [`StorageError`] with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the bucket name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            bucket: self.bucket,
            path: self.path,
            context: self.context,
            source: self.source,
            span_trace: Box::new(SpanTrace::capture()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_kind_is_classified() {
        let err = StorageError::io(
            "test",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err = StorageError::io(
            "test",
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short write"),
        );
        assert_eq!(err.kind(), StorageErrorKind::Io);
        assert!(err.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = StorageError::not_found("memory", "registry", Some("images/a/json"));
        let message = err.to_string();
        assert!(message.contains("[not found]"));
        assert!(message.contains("(bucket: registry)"));
        assert!(message.contains("(path: images/a/json)"));
        assert_eq!(err.path(), Some("images/a/json"));
    }

    #[test]
    fn missing_bucket_has_no_path() {
        let err = StorageError::not_found("memory", "missing", None);
        assert!(err.is_not_found());
        assert_eq!(err.bucket(), Some("missing"));
        assert_eq!(err.path(), None);
    }
}
