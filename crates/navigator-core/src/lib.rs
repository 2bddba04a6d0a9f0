//! navigator-core: cache synchronization engine for a Markdown vault navigator.
//!
//! This crate provides the core functionality for:
//! - Diffing the live vault against a persisted per-file record store
//! - Generating derived content (preview, tags, metadata, feature image)
//!   through pluggable providers
//! - Deferring metadata-dependent work until the host's index is ready
//! - Debouncing vault events and settings edits
//! - Building the tag tree from cached records
//! - VaultHost, MetadataIndex and PersistedStore trait abstractions

pub mod context;
pub mod diff;
pub mod events;
pub mod host;
pub mod markdown;
pub mod metadata_queue;
pub mod providers;
pub mod record;
pub mod scheduler;
pub mod settings;
pub mod settings_reactor;
pub mod store;
pub mod tag_tree;
pub mod vault_sync;

pub use context::{ContextError, StorageContext};
pub use diff::{FileDiff, calculate_file_diff};
pub use events::{EventBus, Subscription};
pub use host::{CachedMetadata, HostError, InMemoryMetadataIndex, InMemoryVault, MetadataIndex, VaultFile, VaultHost};
pub use metadata_queue::MetadataContentQueue;
pub use providers::{ContentProvider, ContentProviderRegistry, ProviderError, ProviderFilter};
pub use record::{ContentType, ContentUpdate, ContentValue, FeatureImageStatus, FileMetadata, FileRecord};
pub use scheduler::CollapsingScheduler;
pub use settings::{EngineTimings, NavigatorSettings};
pub use settings_reactor::{SettingsHandler, SettingsReactor};
pub use store::{ContentChange, InMemoryStore, PersistedStore, RecordMap, StoreError};
pub use tag_tree::{TagTree, TagTreeNode, build_tag_tree};
pub use vault_sync::{VaultEvent, VaultSynchronizer};
