//! navigator-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod daemon;
pub mod json_store;
pub mod metadata_index;
pub mod native_vault;
pub mod watcher;

// Re-export key types for convenience
pub use config::{ConfigError, DaemonConfig};
pub use daemon::Daemon;
pub use json_store::JsonStore;
pub use metadata_index::NativeMetadataIndex;
pub use native_vault::NativeVault;
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
