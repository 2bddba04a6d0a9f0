use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{ContentProvider, ProviderError, Result};
use crate::host::{MetadataIndex, VaultFile};
use crate::markdown;
use crate::record::{ContentType, ContentValue};
use crate::settings::NavigatorSettings;

/// Feature image from a frontmatter property, falling back to the first
/// embedded image in the note.
pub struct FeatureImageProvider {
    index: Arc<dyn MetadataIndex>,
}

impl FeatureImageProvider {
    pub fn new(index: Arc<dyn MetadataIndex>) -> Self {
        Self { index }
    }
}

/// `![[cover.png|300]]` -> `cover.png`
fn clean_image_reference(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('!');
    let inner = trimmed
        .strip_prefix("[[")
        .and_then(|s| s.strip_suffix("]]"))
        .unwrap_or(trimmed);
    let target = inner.split('|').next().unwrap_or(inner).trim();
    (!target.is_empty()).then(|| target.to_string())
}

fn property_image(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => clean_image_reference(s),
        Value::Array(items) => items.iter().find_map(property_image),
        _ => None,
    }
}

#[async_trait]
impl ContentProvider for FeatureImageProvider {
    fn content_type(&self) -> ContentType {
        ContentType::FeatureImage
    }

    fn options_changed(&self, old: &NavigatorSettings, new: &NavigatorSettings) -> bool {
        old.feature_image_properties != new.feature_image_properties
    }

    async fn generate(&self, file: &VaultFile, settings: &NavigatorSettings) -> Result<ContentValue> {
        let data = self
            .index
            .cached_data_for(&file.path)
            .ok_or_else(|| ProviderError::MetadataNotReady(file.path.clone()))?;

        let from_property = data.frontmatter.as_ref().and_then(|fm| {
            settings
                .feature_image_properties
                .iter()
                .find_map(|key| fm.get(key).and_then(property_image))
        });

        let image = from_property.or_else(|| {
            data.embeds
                .iter()
                .find(|target| markdown::is_image_path(target))
                .cloned()
        });

        Ok(ContentValue::FeatureImage { image })
    }
}
