use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use super::{ContentProvider, ProviderError, Result};
use crate::host::{MetadataIndex, VaultFile};
use crate::markdown;
use crate::record::{ContentType, ContentValue};
use crate::settings::NavigatorSettings;

/// Frontmatter and inline tags, taken from the host's metadata index.
pub struct TagProvider {
    index: Arc<dyn MetadataIndex>,
}

impl TagProvider {
    pub fn new(index: Arc<dyn MetadataIndex>) -> Self {
        Self { index }
    }
}

/// Deduplicate case-insensitively, keeping the first spelling seen.
fn dedupe_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| t.trim().trim_start_matches('#').to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .collect()
}

#[async_trait]
impl ContentProvider for TagProvider {
    fn content_type(&self) -> ContentType {
        ContentType::Tags
    }

    fn options_changed(&self, _old: &NavigatorSettings, _new: &NavigatorSettings) -> bool {
        false
    }

    async fn generate(&self, file: &VaultFile, _settings: &NavigatorSettings) -> Result<ContentValue> {
        let data = self
            .index
            .cached_data_for(&file.path)
            .ok_or_else(|| ProviderError::MetadataNotReady(file.path.clone()))?;

        let from_frontmatter = data
            .frontmatter
            .as_ref()
            .map(markdown::frontmatter_tags)
            .unwrap_or_default();

        Ok(ContentValue::Tags(dedupe_tags(
            from_frontmatter.into_iter().chain(data.tags),
        )))
    }
}
