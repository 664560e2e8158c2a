//! Validation for the identifiers which appear in request paths.

use std::fmt;

use crate::error::{RegistryError, RegistryResult};

const MAX_NAME_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;
const MAX_IMAGE_ID_LEN: usize = 128;

/// Check an image id: 1 to 128 ASCII alphanumerics.
pub fn validate_image_id(id: &str) -> RegistryResult<()> {
    if id.is_empty() || id.len() > MAX_IMAGE_ID_LEN || !id.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(RegistryError::InvalidImageId(id.to_string()));
    }
    Ok(())
}

/// Check a tag name.
///
/// Tags start with an alphanumeric or `_`, continue with alphanumerics and
/// `._-`, and are at most 128 characters long.
pub fn validate_tag(tag: &str) -> RegistryResult<()> {
    let mut bytes = tag.bytes();
    let valid = match bytes.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == b'_' => {
            tag.len() <= MAX_TAG_LEN
                && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidTag(tag.to_string()))
    }
}

fn validate_component(component: &str) -> bool {
    !component.is_empty()
        && component.len() <= MAX_NAME_LEN
        && !component.starts_with('.')
        && !component.contains("..")
        && component
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// A validated `namespace/name` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryName {
    namespace: String,
    name: String,
}

impl RepositoryName {
    /// Validate and construct a repository name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> RegistryResult<Self> {
        let namespace = namespace.into();
        let name = name.into();
        if !validate_component(&namespace) || !validate_component(&name) {
            return Err(RegistryError::InvalidName(format!("{namespace}/{name}")));
        }
        Ok(Self { namespace, name })
    }

    /// The namespace (user or organisation).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The repository name within the namespace.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ids() {
        assert!(validate_image_id("511136ea3c5a").is_ok());
        assert!(validate_image_id("").is_err());
        assert!(validate_image_id("../etc").is_err());
        assert!(validate_image_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn tags() {
        for tag in ["latest", "v1.0.2", "_build-3", "A"] {
            assert!(validate_tag(tag).is_ok(), "{tag}");
        }
        for tag in ["", ".hidden", "-flag", "a/b", "tag:1"] {
            assert!(validate_tag(tag).is_err(), "{tag}");
        }
        assert!(validate_tag(&"a".repeat(128)).is_ok());
        assert!(validate_tag(&"a".repeat(129)).is_err());
    }

    #[test]
    fn repository_names() {
        let name = RepositoryName::new("library", "busybox").unwrap();
        assert_eq!(name.to_string(), "library/busybox");
        assert!(RepositoryName::new("my-org", "app_v2.1").is_ok());
        assert!(RepositoryName::new("", "busybox").is_err());
        assert!(RepositoryName::new("library", "..").is_err());
        assert!(RepositoryName::new("library", ".git").is_err());
        assert!(RepositoryName::new("lib/rary", "busybox").is_err());
    }
}
