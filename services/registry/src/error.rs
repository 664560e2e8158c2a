//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Image metadata could not be parsed, or lacks a usable id
    #[error("invalid image metadata: {0}")]
    InvalidMetadata(String),

    /// A checksum string was not of the form `algorithm:hex`
    #[error("invalid checksum format: {0}")]
    InvalidChecksumFormat(String),

    /// The stored layer does not hash to the declared checksum
    #[error("checksum mismatch for image {image}: declared {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Image whose layer must be re-uploaded
        image: String,
        /// Checksum declared by the client
        expected: String,
        /// Checksum of the stored layer
        actual: String,
    },

    /// Image not found
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Repository not found
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// Tag not found
    #[error("tag not found: {repository}:{tag}")]
    TagNotFound {
        /// Repository, as `namespace/name`
        repository: String,
        /// Tag name
        tag: String,
    },

    /// The image exists, but the requested part has not been pushed yet
    #[error("image {image} is not ready: {missing} has not been uploaded")]
    NotReady {
        /// Image id
        image: String,
        /// The missing part of the image (`json`, `layer`, `checksum`, ...)
        missing: &'static str,
    },

    /// The parent chain of an image loops back on itself
    #[error("ancestry of image {image} contains a cycle at {repeated}")]
    AncestryCycle {
        /// Image whose ancestry was requested
        image: String,
        /// The id which appeared twice
        repeated: String,
    },

    /// The parent chain of an image is longer than the configured bound
    #[error("ancestry of image {image} exceeds {limit} entries")]
    AncestryTooDeep {
        /// Image whose ancestry was requested
        image: String,
        /// The configured bound
        limit: usize,
    },

    /// A repository cannot be finalized because an image is not checksummed
    #[error("upload of {repository} is incomplete: image {image} is not checksummed")]
    IncompleteUpload {
        /// Repository, as `namespace/name`
        repository: String,
        /// First image found without a verified checksum
        image: String,
    },

    /// Invalid namespace or repository name
    #[error("invalid repository name: {0}")]
    InvalidName(String),

    /// Invalid tag name
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Invalid image id
    #[error("invalid image id: {0}")]
    InvalidImageId(String),

    /// The access gate refused the request
    #[error("access denied: {0}")]
    Denied(String),

    /// A stored record could not be decoded
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::ImageNotFound(_)
            | RegistryError::RepositoryNotFound(_)
            | RegistryError::TagNotFound { .. } => StatusCode::NOT_FOUND,
            RegistryError::InvalidMetadata(_)
            | RegistryError::InvalidChecksumFormat(_)
            | RegistryError::ChecksumMismatch { .. }
            | RegistryError::AncestryCycle { .. }
            | RegistryError::AncestryTooDeep { .. }
            | RegistryError::IncompleteUpload { .. }
            | RegistryError::InvalidName(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::InvalidImageId(_) => StatusCode::BAD_REQUEST,
            RegistryError::NotReady { .. } => StatusCode::CONFLICT,
            RegistryError::Denied(_) => StatusCode::FORBIDDEN,
            RegistryError::CorruptRecord(_) | RegistryError::Storage(_) | RegistryError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code used in error response bodies
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::InvalidMetadata(_) => "METADATA_INVALID",
            RegistryError::InvalidChecksumFormat(_) => "CHECKSUM_INVALID",
            RegistryError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            RegistryError::ImageNotFound(_) => "IMAGE_UNKNOWN",
            RegistryError::RepositoryNotFound(_) => "REPOSITORY_UNKNOWN",
            RegistryError::TagNotFound { .. } => "TAG_UNKNOWN",
            RegistryError::NotReady { .. } => "IMAGE_NOT_READY",
            RegistryError::AncestryCycle { .. } | RegistryError::AncestryTooDeep { .. } => {
                "ANCESTRY_INVALID"
            }
            RegistryError::IncompleteUpload { .. } => "UPLOAD_INCOMPLETE",
            RegistryError::InvalidName(_) => "NAME_INVALID",
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::InvalidImageId(_) => "IMAGE_ID_INVALID",
            RegistryError::Denied(_) => "DENIED",
            RegistryError::CorruptRecord(_) | RegistryError::Storage(_) | RegistryError::Io(_) => {
                "UNKNOWN"
            }
        }
    }

    /// Whether the client can recover by repeating this step, or the earlier
    /// step the error names.
    ///
    /// A checksum mismatch is fixed by re-uploading the layer, an incomplete
    /// upload by finishing the named image, and transient storage failures
    /// by repeating the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::ChecksumMismatch { .. }
            | RegistryError::NotReady { .. }
            | RegistryError::IncompleteUpload { .. }
            | RegistryError::Io(_) => true,
            RegistryError::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error reflects a server-side failure rather than a
    /// problem with the request.
    pub fn is_internal(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// The message shown to clients.
    ///
    /// Internal failures carry storage paths in their `Display` output, so
    /// they are replaced by a generic message here.
    pub fn client_message(&self) -> String {
        if self.is_internal() {
            "internal storage error".to_string()
        } else {
            self.to_string()
        }
    }
}

/// Error response body
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.client_message(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}
