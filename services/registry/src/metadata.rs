//! Typed extraction of the two fields the registry needs from image JSON.

use bytes::Bytes;
use serde::Deserialize;

use crate::error::{RegistryError, RegistryResult};

#[derive(Debug, Deserialize)]
struct RawMetadata {
    id: Option<serde_json::Value>,
    #[serde(default)]
    parent: Option<serde_json::Value>,
}

/// Image metadata as submitted by a client.
///
/// The raw bytes are stored and returned verbatim. Only `id` and `parent`
/// are read from them, once, when the metadata is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    id: String,
    parent: Option<String>,
    raw: Bytes,
}

impl ImageMetadata {
    /// Parse `raw` as the metadata of image `expected_id`.
    ///
    /// The document must be a JSON object whose `id` matches `expected_id`.
    /// A missing, null or empty `parent` marks a root image.
    pub fn parse(expected_id: &str, raw: Bytes) -> RegistryResult<Self> {
        let fields: RawMetadata = serde_json::from_slice(&raw)
            .map_err(|err| RegistryError::InvalidMetadata(format!("not a JSON object: {err}")))?;

        let id = match fields.id {
            Some(serde_json::Value::String(id)) if !id.is_empty() => id,
            Some(_) => {
                return Err(RegistryError::InvalidMetadata(
                    "`id` must be a non-empty string".into(),
                ));
            }
            None => return Err(RegistryError::InvalidMetadata("missing `id`".into())),
        };

        if id != expected_id {
            return Err(RegistryError::InvalidMetadata(format!(
                "`id` {id} does not match image {expected_id}"
            )));
        }

        let parent = match fields.parent {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(parent)) if parent.is_empty() => None,
            Some(serde_json::Value::String(parent)) => Some(parent),
            Some(_) => {
                return Err(RegistryError::InvalidMetadata(
                    "`parent` must be a string".into(),
                ));
            }
        };

        if parent.as_deref() == Some(id.as_str()) {
            return Err(RegistryError::InvalidMetadata(format!(
                "image {id} names itself as parent"
            )));
        }

        Ok(Self { id, parent, raw })
    }

    /// The image id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The parent image id, if any.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// The metadata exactly as submitted.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(id: &str, json: &str) -> RegistryResult<ImageMetadata> {
        ImageMetadata::parse(id, Bytes::copy_from_slice(json.as_bytes()))
    }

    #[test]
    fn extracts_id_and_parent() {
        let meta = parse("b", r#"{"id":"b","parent":"a","config":{"Cmd":null}}"#).unwrap();
        assert_eq!(meta.id(), "b");
        assert_eq!(meta.parent(), Some("a"));
        assert_eq!(
            meta.raw().as_ref(),
            br#"{"id":"b","parent":"a","config":{"Cmd":null}}"#
        );
    }

    #[test]
    fn empty_parent_is_root() {
        assert_eq!(parse("a", r#"{"id":"a","parent":""}"#).unwrap().parent(), None);
        assert_eq!(parse("a", r#"{"id":"a","parent":null}"#).unwrap().parent(), None);
        assert_eq!(parse("a", r#"{"id":"a"}"#).unwrap().parent(), None);
    }

    #[test]
    fn rejects_bad_metadata() {
        for (id, json) in [
            ("a", "not json"),
            ("a", "[]"),
            ("a", r#"{"parent":"b"}"#),
            ("a", r#"{"id":42}"#),
            ("a", r#"{"id":"b"}"#),
            ("a", r#"{"id":"a","parent":"a"}"#),
            ("a", r#"{"id":"a","parent":7}"#),
        ] {
            let err = parse(id, json).unwrap_err();
            assert!(
                matches!(err, RegistryError::InvalidMetadata(_)),
                "{json}: {err:?}"
            );
        }
    }
}
