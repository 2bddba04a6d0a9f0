use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::sync::Arc;

use super::{ContentProvider, ProviderError, Result};
use crate::host::{MetadataIndex, VaultFile};
use crate::markdown::Frontmatter;
use crate::record::{ContentType, ContentValue, FileMetadata};
use crate::settings::NavigatorSettings;

/// Display metadata (name, dates, icon, color), the hidden flag and the
/// custom property, all read from frontmatter.
pub struct MetadataProvider {
    index: Arc<dyn MetadataIndex>,
}

impl MetadataProvider {
    pub fn new(index: Arc<dyn MetadataIndex>) -> Self {
        Self { index }
    }
}

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"];

/// Milliseconds since epoch. Naive timestamps are read as UTC.
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            for format in NAIVE_FORMATS {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(dt.and_utc().timestamp_millis());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

fn string_field(frontmatter: &Frontmatter, key: &str) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    match frontmatter.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.trim().is_empty() && !s.eq_ignore_ascii_case("false"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn render_property(value: &Value) -> Option<String> {
    let rendered = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(render_property)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    };
    (!rendered.is_empty()).then_some(rendered)
}

fn extract(frontmatter: &Frontmatter, settings: &NavigatorSettings) -> (FileMetadata, Option<String>) {
    let mut metadata = FileMetadata {
        hidden: settings
            .excluded_file_properties
            .iter()
            .any(|key| frontmatter.get(key).is_some_and(is_truthy)),
        ..Default::default()
    };

    if settings.use_frontmatter_metadata {
        metadata.name = string_field(frontmatter, &settings.frontmatter_name_field);
        metadata.created = frontmatter
            .get(&settings.frontmatter_created_field)
            .and_then(parse_timestamp);
        metadata.modified = frontmatter
            .get(&settings.frontmatter_modified_field)
            .and_then(parse_timestamp);
        metadata.icon = string_field(frontmatter, &settings.frontmatter_icon_field);
        metadata.color = string_field(frontmatter, &settings.frontmatter_color_field);
    }

    let custom_property = if settings.custom_property_field.is_empty() {
        None
    } else {
        frontmatter
            .get(&settings.custom_property_field)
            .and_then(render_property)
    };

    (metadata, custom_property)
}

#[async_trait]
impl ContentProvider for MetadataProvider {
    fn content_type(&self) -> ContentType {
        ContentType::Metadata
    }

    fn options_changed(&self, old: &NavigatorSettings, new: &NavigatorSettings) -> bool {
        old.use_frontmatter_metadata != new.use_frontmatter_metadata
            || old.frontmatter_name_field != new.frontmatter_name_field
            || old.frontmatter_created_field != new.frontmatter_created_field
            || old.frontmatter_modified_field != new.frontmatter_modified_field
            || old.frontmatter_icon_field != new.frontmatter_icon_field
            || old.frontmatter_color_field != new.frontmatter_color_field
            || old.custom_property_field != new.custom_property_field
            || old.excluded_file_properties != new.excluded_file_properties
    }

    async fn generate(&self, file: &VaultFile, settings: &NavigatorSettings) -> Result<ContentValue> {
        let data = self
            .index
            .cached_data_for(&file.path)
            .ok_or_else(|| ProviderError::MetadataNotReady(file.path.clone()))?;

        let (metadata, custom_property) = match data.frontmatter.as_ref() {
            Some(frontmatter) => extract(frontmatter, settings),
            None => (FileMetadata::default(), None),
        };

        Ok(ContentValue::Metadata {
            metadata,
            custom_property,
        })
    }
}
