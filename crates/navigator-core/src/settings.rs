//! Settings snapshots and engine timing configuration.
//!
//! `NavigatorSettings` is treated as an immutable value: every change produces
//! a new snapshot, and consumers compare two snapshots rather than watching a
//! mutable object.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::record::ContentType;

/// User-facing settings that control which content is generated and what is
/// visible in the tag tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NavigatorSettings {
    // Tags
    pub show_tags: bool,
    pub show_hidden_items: bool,
    pub hidden_tags: Vec<String>,

    // Preview
    pub show_file_preview: bool,
    pub skip_headings_in_preview: bool,
    pub skip_code_blocks_in_preview: bool,
    pub preview_properties: Vec<String>,

    // Feature image
    pub show_feature_image: bool,
    pub feature_image_properties: Vec<String>,

    // Frontmatter metadata
    pub use_frontmatter_metadata: bool,
    pub frontmatter_name_field: String,
    pub frontmatter_created_field: String,
    pub frontmatter_modified_field: String,
    pub frontmatter_icon_field: String,
    pub frontmatter_color_field: String,
    pub custom_property_field: String,

    // Exclusions
    pub excluded_folders: Vec<String>,
    pub excluded_file_properties: Vec<String>,
}

impl Default for NavigatorSettings {
    fn default() -> Self {
        Self {
            show_tags: true,
            show_hidden_items: false,
            hidden_tags: Vec::new(),
            show_file_preview: true,
            skip_headings_in_preview: true,
            skip_code_blocks_in_preview: true,
            preview_properties: Vec::new(),
            show_feature_image: true,
            feature_image_properties: vec!["thumbnail".into(), "featureResized".into(), "feature".into()],
            use_frontmatter_metadata: false,
            frontmatter_name_field: "title".into(),
            frontmatter_created_field: "created".into(),
            frontmatter_modified_field: "modified".into(),
            frontmatter_icon_field: "icon".into(),
            frontmatter_color_field: "color".into(),
            custom_property_field: String::new(),
            excluded_folders: Vec::new(),
            excluded_file_properties: Vec::new(),
        }
    }
}

impl NavigatorSettings {
    /// Whether the provider for `kind` should run at all.
    pub fn is_enabled(&self, kind: ContentType) -> bool {
        match kind {
            ContentType::Preview => self.show_file_preview,
            ContentType::FeatureImage => self.show_feature_image,
            // Metadata also carries the hidden flag, so it runs whenever
            // excluded-file properties are configured.
            ContentType::Metadata => {
                self.use_frontmatter_metadata
                    || !self.excluded_file_properties.is_empty()
                    || !self.custom_property_field.is_empty()
            }
            ContentType::Tags => self.show_tags,
        }
    }

    /// Metadata-dependent kinds that are currently enabled.
    pub fn metadata_dependent_types(&self) -> Vec<ContentType> {
        ContentType::ALL
            .into_iter()
            .filter(|kind| kind.is_metadata_dependent() && self.is_enabled(*kind))
            .collect()
    }

    /// Whether `path` lives inside one of the excluded folders.
    pub fn is_path_excluded(&self, path: &str) -> bool {
        self.excluded_folders.iter().any(|folder| {
            let folder = folder.trim_matches('/');
            !folder.is_empty()
                && (path == folder
                    || path
                        .strip_prefix(folder)
                        .is_some_and(|rest| rest.starts_with('/')))
        })
    }

    /// Whether `tag` (without `#`) falls under one of the hidden tag prefixes.
    pub fn is_tag_hidden(&self, tag: &str) -> bool {
        let tag = tag.to_lowercase();
        self.hidden_tags.iter().any(|hidden| {
            let hidden = hidden.trim_start_matches('#').to_lowercase();
            !hidden.is_empty()
                && (tag == hidden
                    || tag
                        .strip_prefix(&hidden)
                        .is_some_and(|rest| rest.starts_with('/')))
        })
    }

    /// Whether a change between `old` and `self` alters which stored tags the
    /// tag tree shows. `show_tags` only affects what gets stored.
    pub fn tag_visibility_changed(&self, old: &NavigatorSettings) -> bool {
        self.show_hidden_items != old.show_hidden_items
            || self.hidden_tags != old.hidden_tags
            || self.excluded_folders != old.excluded_folders
            || self.excluded_file_properties != old.excluded_file_properties
    }
}

/// Names (serialized, camelCase) of the fields that differ between two
/// snapshots.
pub fn changed_fields(old: &NavigatorSettings, new: &NavigatorSettings) -> BTreeSet<String> {
    let (Ok(serde_json::Value::Object(old)), Ok(serde_json::Value::Object(new))) =
        (serde_json::to_value(old), serde_json::to_value(new))
    else {
        return BTreeSet::new();
    };

    old.keys()
        .chain(new.keys())
        .filter(|key| old.get(*key) != new.get(*key))
        .cloned()
        .collect()
}

/// Timing and batching knobs for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineTimings {
    /// Quiet period before a burst of settings edits is handled
    #[serde(with = "millis")]
    pub settings_debounce: Duration,
    /// Quiet period before create/delete/rename events trigger a diff pass
    #[serde(with = "millis")]
    pub vault_debounce: Duration,
    /// Coalescing window for tag-change notifications
    #[serde(with = "millis")]
    pub tag_tree_debounce: Duration,
    /// Delay before an unresolved metadata wait is reported
    #[serde(with = "millis")]
    pub metadata_diagnostic_delay: Duration,
    /// Files generated per provider batch
    pub batch_size: usize,
}

/// Diagnostic delay for metadata waits.
pub const METADATA_DIAGNOSTIC_DELAY: Duration = Duration::from_secs(10);

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            settings_debounce: Duration::from_millis(250),
            vault_debounce: Duration::from_millis(300),
            tag_tree_debounce: Duration::from_millis(100),
            metadata_diagnostic_delay: METADATA_DIAGNOSTIC_DELAY,
            batch_size: 50,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_fields_names_only_differences() {
        let old = NavigatorSettings::default();
        let new = NavigatorSettings {
            show_tags: false,
            hidden_tags: vec!["archive".into()],
            ..old.clone()
        };

        let changed = changed_fields(&old, &new);
        assert_eq!(
            changed.into_iter().collect::<Vec<_>>(),
            vec!["hiddenTags".to_string(), "showTags".to_string()]
        );
        assert!(changed_fields(&old, &old).is_empty());
    }

    #[test]
    fn test_excluded_folder_matches_whole_segments() {
        let settings = NavigatorSettings {
            excluded_folders: vec!["archive/".into()],
            ..Default::default()
        };
        assert!(settings.is_path_excluded("archive/old.md"));
        assert!(settings.is_path_excluded("archive"));
        assert!(!settings.is_path_excluded("archived/new.md"));
        assert!(!settings.is_path_excluded("notes/archive.md"));
    }

    #[test]
    fn test_hidden_tags_match_prefix_case_insensitively() {
        let settings = NavigatorSettings {
            hidden_tags: vec!["#Private".into()],
            ..Default::default()
        };
        assert!(settings.is_tag_hidden("private"));
        assert!(settings.is_tag_hidden("private/journal"));
        assert!(!settings.is_tag_hidden("privateer"));
    }

    #[test]
    fn test_tag_visibility_ignores_show_tags() {
        let old = NavigatorSettings::default();
        let tags_off = NavigatorSettings {
            show_tags: false,
            ..old.clone()
        };
        assert!(!tags_off.tag_visibility_changed(&old));

        let excluded = NavigatorSettings {
            excluded_file_properties: vec!["private".into()],
            ..old.clone()
        };
        assert!(excluded.tag_visibility_changed(&old));
        assert!(old.tag_visibility_changed(&excluded));
    }

    #[test]
    fn test_metadata_dependent_types_follow_toggles() {
        let settings = NavigatorSettings {
            show_tags: true,
            show_feature_image: false,
            use_frontmatter_metadata: false,
            ..Default::default()
        };
        assert_eq!(settings.metadata_dependent_types(), vec![ContentType::Tags]);
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: NavigatorSettings =
            serde_json::from_str(r#"{ "showTags": false }"#).unwrap();
        assert!(!settings.show_tags);
        assert!(settings.show_file_preview);
    }

    #[test]
    fn test_timings_round_trip_as_millis() {
        let timings: EngineTimings =
            serde_json::from_str(r#"{ "settingsDebounce": 50, "batchSize": 5 }"#).unwrap();
        assert_eq!(timings.settings_debounce, Duration::from_millis(50));
        assert_eq!(timings.batch_size, 5);
        assert_eq!(timings.metadata_diagnostic_delay, METADATA_DIAGNOSTIC_DELAY);
    }
}
