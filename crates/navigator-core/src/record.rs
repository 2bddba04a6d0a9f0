//! Cached per-file records and the content kinds derived into them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of derived content. Each kind is produced by exactly one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentType {
    Preview,
    FeatureImage,
    Metadata,
    Tags,
}

impl ContentType {
    pub const ALL: [ContentType; 4] = [
        ContentType::Preview,
        ContentType::FeatureImage,
        ContentType::Metadata,
        ContentType::Tags,
    ];

    /// Whether this kind can only be computed once the host's metadata index
    /// has parsed the file.
    pub fn is_metadata_dependent(self) -> bool {
        !matches!(self, ContentType::Preview)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Preview => "preview",
            ContentType::FeatureImage => "featureImage",
            ContentType::Metadata => "metadata",
            ContentType::Tags => "tags",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeatureImageStatus {
    Found,
    NotFound,
}

/// Frontmatter-derived display metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: Option<String>,
    /// Milliseconds since Unix epoch
    pub created: Option<i64>,
    /// Milliseconds since Unix epoch
    pub modified: Option<i64>,
    pub icon: Option<String>,
    pub color: Option<String>,
    /// Set when one of the excluded-file properties is truthy on the note
    pub hidden: bool,
}

/// One cached entry per tracked path.
///
/// `None` in a derived field means "not computed yet". A record is only fresh
/// while `mtime` equals the live file's modification time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    /// Modification time in milliseconds since epoch
    pub mtime: u64,
    pub tags: Option<Vec<String>>,
    pub preview: Option<String>,
    pub feature_image: Option<String>,
    pub feature_image_status: Option<FeatureImageStatus>,
    pub metadata: Option<FileMetadata>,
    pub custom_property: Option<String>,
    pub word_count: Option<u64>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, mtime: u64) -> Self {
        Self {
            path: path.into(),
            mtime,
            tags: None,
            preview: None,
            feature_image: None,
            feature_image_status: None,
            metadata: None,
            custom_property: None,
            word_count: None,
        }
    }

    /// Whether the field for `kind` still has to be generated.
    pub fn needs(&self, kind: ContentType) -> bool {
        match kind {
            ContentType::Preview => self.preview.is_none(),
            ContentType::FeatureImage => self.feature_image_status.is_none(),
            ContentType::Metadata => self.metadata.is_none(),
            ContentType::Tags => self.tags.is_none(),
        }
    }

    /// Reset the fields owned by `kind` to "not computed".
    pub fn clear(&mut self, kind: ContentType) {
        match kind {
            ContentType::Preview => {
                self.preview = None;
                self.word_count = None;
            }
            ContentType::FeatureImage => {
                self.feature_image = None;
                self.feature_image_status = None;
            }
            ContentType::Metadata => {
                self.metadata = None;
                self.custom_property = None;
            }
            ContentType::Tags => self.tags = None,
        }
    }

    pub fn clear_all(&mut self) {
        for kind in ContentType::ALL {
            self.clear(kind);
        }
    }

    pub fn has_tags(&self) -> bool {
        self.tags.as_ref().is_some_and(|t| !t.is_empty())
    }

    pub fn is_hidden(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.hidden)
    }
}

/// Freshly generated content for one file, tagged with the mtime it was
/// generated against.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentUpdate {
    pub path: String,
    pub mtime: u64,
    pub value: ContentValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentValue {
    Preview {
        text: String,
        word_count: u64,
    },
    FeatureImage {
        image: Option<String>,
    },
    Metadata {
        metadata: FileMetadata,
        custom_property: Option<String>,
    },
    Tags(Vec<String>),
}

impl ContentValue {
    pub fn kind(&self) -> ContentType {
        match self {
            ContentValue::Preview { .. } => ContentType::Preview,
            ContentValue::FeatureImage { .. } => ContentType::FeatureImage,
            ContentValue::Metadata { .. } => ContentType::Metadata,
            ContentValue::Tags(_) => ContentType::Tags,
        }
    }

    /// Write this value into `record`.
    pub fn apply(self, record: &mut FileRecord) {
        match self {
            ContentValue::Preview { text, word_count } => {
                record.preview = Some(text);
                record.word_count = Some(word_count);
            }
            ContentValue::FeatureImage { image } => {
                record.feature_image_status = Some(if image.is_some() {
                    FeatureImageStatus::Found
                } else {
                    FeatureImageStatus::NotFound
                });
                record.feature_image = image;
            }
            ContentValue::Metadata {
                metadata,
                custom_property,
            } => {
                record.metadata = Some(metadata);
                record.custom_property = custom_property;
            }
            ContentValue::Tags(tags) => record.tags = Some(tags),
        }
    }
}
