use async_trait::async_trait;
use std::sync::Arc;

use super::{ContentProvider, Result};
use crate::host::{VaultFile, VaultHost};
use crate::markdown::{self, Frontmatter, PreviewOptions};
use crate::record::{ContentType, ContentValue};
use crate::settings::NavigatorSettings;

/// Plain-text preview and word count, read straight from the file.
///
/// Does not need the metadata index: frontmatter is parsed from the text.
pub struct PreviewProvider {
    host: Arc<dyn VaultHost>,
}

impl PreviewProvider {
    pub fn new(host: Arc<dyn VaultHost>) -> Self {
        Self { host }
    }
}

fn options(settings: &NavigatorSettings) -> PreviewOptions {
    PreviewOptions {
        skip_headings: settings.skip_headings_in_preview,
        skip_code_blocks: settings.skip_code_blocks_in_preview,
        ..Default::default()
    }
}

/// First non-empty string among the configured preview properties.
fn property_preview<'a>(frontmatter: Option<&'a Frontmatter>, properties: &[String]) -> Option<&'a str> {
    let frontmatter = frontmatter?;
    properties
        .iter()
        .filter_map(|key| frontmatter.get(key)?.as_str())
        .map(str::trim)
        .find(|value| !value.is_empty())
}

#[async_trait]
impl ContentProvider for PreviewProvider {
    fn content_type(&self) -> ContentType {
        ContentType::Preview
    }

    fn options_changed(&self, old: &NavigatorSettings, new: &NavigatorSettings) -> bool {
        old.skip_headings_in_preview != new.skip_headings_in_preview
            || old.skip_code_blocks_in_preview != new.skip_code_blocks_in_preview
            || old.preview_properties != new.preview_properties
    }

    async fn generate(&self, file: &VaultFile, settings: &NavigatorSettings) -> Result<ContentValue> {
        let content = self.host.read(&file.path).await?;
        let parsed = markdown::parse(&content);
        let options = options(settings);

        let text = match property_preview(parsed.frontmatter.as_ref(), &settings.preview_properties) {
            Some(value) => markdown::preview_text(value, options),
            None => markdown::preview_text(parsed.body, options),
        };

        Ok(ContentValue::Preview {
            text,
            word_count: markdown::word_count(parsed.body),
        })
    }
}
