//! Hierarchical tag tree built from cached records.
//!
//! `build_tag_tree` is a pure function of a record snapshot and the current
//! settings. The result is published as one immutable value; nothing mutates
//! a tree after it is built.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::record::FileRecord;
use crate::settings::NavigatorSettings;

/// One segment of a nested tag (`project/rust` has nodes `project` and
/// `project/rust`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagTreeNode {
    /// Segment name as first spelled in the vault
    pub name: String,
    /// Lowercased full path, the lookup key
    pub path: String,
    /// Full path as first spelled in the vault
    pub display_path: String,
    pub children: BTreeMap<String, TagTreeNode>,
    /// Notes tagged with exactly this tag
    pub notes: BTreeSet<String>,
    /// Number of notes tagged with exactly this tag
    pub note_count: usize,
    /// Unique notes in this node and all descendants
    pub total_count: usize,
}

impl TagTreeNode {
    fn new(name: &str, path: String, display_path: String) -> Self {
        Self {
            name: name.to_string(),
            path,
            display_path,
            ..Default::default()
        }
    }

    /// Notes on this node, optionally including every descendant.
    pub fn note_paths(&self, include_descendants: bool) -> BTreeSet<String> {
        let mut notes = self.notes.clone();
        if include_descendants {
            for child in self.children.values() {
                notes.extend(child.note_paths(true));
            }
        }
        notes
    }

    fn finalize(&mut self) -> HashSet<String> {
        let mut subtree: HashSet<String> = self.notes.iter().cloned().collect();
        for child in self.children.values_mut() {
            subtree.extend(child.finalize());
        }
        self.note_count = self.notes.len();
        self.total_count = subtree.len();
        subtree
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagTree {
    pub roots: BTreeMap<String, TagTreeNode>,
    /// Markdown notes with no visible tag
    pub untagged_count: usize,
    /// Notes with at least one visible tag
    pub tagged_count: usize,
}

impl TagTree {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Look up a node by tag path, case-insensitively.
    pub fn find(&self, tag_path: &str) -> Option<&TagTreeNode> {
        let key = normalize(tag_path)?.to_lowercase();
        let mut segments = key.split('/');
        let mut node = self.roots.get(segments.next()?)?;
        for segment in segments {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    /// Every node path, parents before children, in sorted order.
    pub fn collect_paths(&self) -> Vec<String> {
        fn walk(node: &TagTreeNode, out: &mut Vec<String>) {
            out.push(node.path.clone());
            for child in node.children.values() {
                walk(child, out);
            }
        }
        let mut out = Vec::new();
        for root in self.roots.values() {
            walk(root, &mut out);
        }
        out
    }
}

/// Strip `#` and surrounding slashes; `None` if nothing is left.
fn normalize(tag: &str) -> Option<&str> {
    let tag = tag.trim().trim_start_matches('#').trim_matches('/');
    (!tag.is_empty()).then_some(tag)
}

fn is_note(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("md"))
}

fn insert_tag(roots: &mut BTreeMap<String, TagTreeNode>, tag: &str, note: &str) {
    let mut level = roots;
    let mut path = String::new();
    let mut display_path = String::new();
    let mut segments = tag.split('/').filter(|s| !s.is_empty()).peekable();

    while let Some(segment) = segments.next() {
        if !path.is_empty() {
            path.push('/');
            display_path.push('/');
        }
        let key = segment.to_lowercase();
        path.push_str(&key);
        display_path.push_str(segment);

        let node = level
            .entry(key)
            .or_insert_with(|| TagTreeNode::new(segment, path.clone(), display_path.clone()));
        // Keep the first spelling for the rest of the path
        display_path.clone_from(&node.display_path);

        if segments.peek().is_none() {
            node.notes.insert(note.to_string());
            return;
        }
        level = &mut node.children;
    }
}

/// Build the tag tree for a record snapshot.
///
/// Skips records in excluded folders. Hidden notes and hidden tags are
/// skipped unless `show_hidden_items` is set.
pub fn build_tag_tree(records: &HashMap<String, FileRecord>, settings: &NavigatorSettings) -> TagTree {
    let mut tree = TagTree::default();

    let mut paths: Vec<&String> = records.keys().collect();
    paths.sort();

    for path in paths {
        let record = &records[path];
        if settings.is_path_excluded(path) {
            continue;
        }
        if record.is_hidden() && !settings.show_hidden_items {
            continue;
        }

        let visible: Vec<&str> = record
            .tags
            .iter()
            .flatten()
            .filter_map(|tag| normalize(tag))
            .filter(|tag| settings.show_hidden_items || !settings.is_tag_hidden(tag))
            .collect();

        if visible.is_empty() {
            if is_note(path) {
                tree.untagged_count += 1;
            }
            continue;
        }

        tree.tagged_count += 1;
        for tag in visible {
            insert_tag(&mut tree.roots, tag, path);
        }
    }

    for root in tree.roots.values_mut() {
        root.finalize();
    }
    tree
}
