//! Materializing an image's parent chain.

use std::collections::{HashMap, HashSet};

use crate::error::{RegistryError, RegistryResult};

/// Default bound on the length of an ancestry list.
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Lookup of an image's parent by id.
#[async_trait::async_trait]
pub trait ParentIndex: Send + Sync {
    /// The parent of `id`, or `None` for a root image.
    ///
    /// Fails with [`RegistryError::ImageNotFound`] if `id` is unknown.
    async fn parent_of(&self, id: &str) -> RegistryResult<Option<String>>;
}

#[async_trait::async_trait]
impl ParentIndex for HashMap<String, Option<String>> {
    async fn parent_of(&self, id: &str) -> RegistryResult<Option<String>> {
        self.get(id)
            .cloned()
            .ok_or_else(|| RegistryError::ImageNotFound(id.to_string()))
    }
}

/// Walks parent links to build an ancestry list, self first and root last.
///
/// The walk is bounded: it fails on the first id seen twice, and on chains
/// longer than `max_depth` entries.
#[derive(Debug, Clone, Copy)]
pub struct AncestryBuilder {
    max_depth: usize,
}

impl Default for AncestryBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl AncestryBuilder {
    /// Create a builder with the given bound on ancestry length.
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }

    /// The bound on ancestry length.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Build the ancestry of `id`, whose own parent is `parent`.
    ///
    /// Ancestors only need to be known to `index`; they do not have to be
    /// fully uploaded.
    #[tracing::instrument(skip(self, index), level = "debug")]
    pub async fn build<I>(
        &self,
        id: &str,
        parent: Option<&str>,
        index: &I,
    ) -> RegistryResult<Vec<String>>
    where
        I: ParentIndex + ?Sized,
    {
        let mut ancestry = vec![id.to_string()];
        let mut seen: HashSet<String> = HashSet::from([id.to_string()]);
        let mut next = parent.map(str::to_string);

        while let Some(current) = next {
            if !seen.insert(current.clone()) {
                return Err(RegistryError::AncestryCycle {
                    image: id.to_string(),
                    repeated: current,
                });
            }
            if ancestry.len() >= self.max_depth {
                return Err(RegistryError::AncestryTooDeep {
                    image: id.to_string(),
                    limit: self.max_depth,
                });
            }

            next = index.parent_of(&current).await?;
            ancestry.push(current);
        }

        tracing::debug!(depth = ancestry.len(), "built ancestry");
        Ok(ancestry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(links: &[(&str, Option<&str>)]) -> HashMap<String, Option<String>> {
        links
            .iter()
            .map(|(id, parent)| (id.to_string(), parent.map(str::to_string)))
            .collect()
    }

    #[tokio::test]
    async fn root_image() {
        let index = index(&[]);
        let ancestry = AncestryBuilder::default()
            .build("a", None, &index)
            .await
            .unwrap();
        assert_eq!(ancestry, vec!["a"]);
    }

    #[tokio::test]
    async fn chain_is_self_first() {
        let index = index(&[("p", Some("g")), ("g", None)]);
        let ancestry = AncestryBuilder::default()
            .build("c", Some("p"), &index)
            .await
            .unwrap();
        assert_eq!(ancestry, vec!["c", "p", "g"]);
    }

    #[tokio::test]
    async fn cycle_is_detected() {
        let index = index(&[("p", Some("g")), ("g", Some("p"))]);
        let err = AncestryBuilder::default()
            .build("c", Some("p"), &index)
            .await
            .unwrap_err();
        assert!(
            matches!(err, RegistryError::AncestryCycle { ref image, ref repeated } if image == "c" && repeated == "p"),
            "{err:?}"
        );

        let index = self::index(&[("p", Some("c"))]);
        let err = AncestryBuilder::default()
            .build("c", Some("p"), &index)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AncestryCycle { .. }));
    }

    #[tokio::test]
    async fn depth_is_bounded() {
        let index = index(&[("b", Some("a")), ("a", None)]);
        let builder = AncestryBuilder::new(2);
        let err = builder.build("c", Some("b"), &index).await.unwrap_err();
        assert!(matches!(err, RegistryError::AncestryTooDeep { limit: 2, .. }));

        let ancestry = AncestryBuilder::new(3)
            .build("c", Some("b"), &index)
            .await
            .unwrap();
        assert_eq!(ancestry, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn unknown_parent_fails() {
        let index = index(&[]);
        let err = AncestryBuilder::default()
            .build("c", Some("missing"), &index)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ImageNotFound(ref id) if id == "missing"));
    }
}
