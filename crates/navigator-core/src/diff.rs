//! Diff between the live vault and the persisted records.

use std::collections::{HashMap, HashSet};

use crate::host::VaultFile;
use crate::record::FileRecord;

/// Result of comparing live files against cached records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileDiff {
    /// Live files with no record
    pub to_add: Vec<VaultFile>,
    /// Live files whose record has a different mtime
    pub to_update: Vec<VaultFile>,
    /// Recorded paths that are no longer live
    pub to_remove: Vec<String>,
    /// The record snapshot the diff was computed against
    pub cached_files: HashMap<String, FileRecord>,
}

impl FileDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }

    /// Added and updated files, in that order.
    pub fn changed_files(&self) -> Vec<VaultFile> {
        self.to_add.iter().chain(&self.to_update).cloned().collect()
    }
}

/// Compute `(to_add, to_update, to_remove)` for a snapshot of both sides.
///
/// Pure: no store access, no side effects. Duplicate live paths count once.
pub fn calculate_file_diff(live: &[VaultFile], cached: HashMap<String, FileRecord>) -> FileDiff {
    let mut seen: HashSet<&str> = HashSet::with_capacity(live.len());
    let mut to_add = Vec::new();
    let mut to_update = Vec::new();

    for file in live {
        if !seen.insert(file.path.as_str()) {
            continue;
        }
        match cached.get(&file.path) {
            None => to_add.push(file.clone()),
            Some(record) if record.mtime != file.mtime => to_update.push(file.clone()),
            Some(_) => {}
        }
    }

    let mut to_remove: Vec<String> = cached
        .keys()
        .filter(|path| !seen.contains(path.as_str()))
        .cloned()
        .collect();
    to_remove.sort();

    FileDiff {
        to_add,
        to_update,
        to_remove,
        cached_files: cached,
    }
}
