//! End-to-end tests for navigator-daemon.
//!
//! Drives the daemon against a temporary vault on disk: initial load, cache
//! persistence, filesystem batches and settings reloads.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, SystemTime};

use navigator_core::ContentType;
use navigator_daemon::{Daemon, DaemonConfig, FileEvent, FileEventKind, JsonStore};
use tempfile::TempDir;

const FAST_TIMINGS: &str = r#""timings": { "settingsDebounce": 20, "vaultDebounce": 20, "tagTreeDebounce": 10 }"#;

/// Write `content` at `rel` and pin its mtime so successive writes always
/// look modified.
fn write_note(root: &Path, rel: &str, content: &str, mtime_secs: u64) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime_secs))
        .unwrap();
}

fn write_settings(root: &Path, body: &str, mtime_secs: u64) {
    let path = DaemonConfig::default_settings_path(root);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, format!("{{ {body}, {FAST_TIMINGS} }}")).unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime_secs))
        .unwrap();
}

async fn open_daemon(root: &Path) -> Daemon {
    let config = DaemonConfig::load(&root.to_string_lossy(), None).unwrap();
    Daemon::open(config).await.unwrap()
}

fn changed(path: &str) -> FileEvent {
    FileEvent {
        path: path.into(),
        kind: FileEventKind::Changed,
    }
}

fn removed(path: &str) -> FileEvent {
    FileEvent {
        path: path.into(),
        kind: FileEventKind::Removed,
    }
}

/// Let spawned handlers and debounced passes run before settling.
async fn settle(daemon: &Daemon) -> std::sync::Arc<navigator_core::TagTree> {
    tokio::time::sleep(Duration::from_millis(150)).await;
    tokio::time::timeout(Duration::from_secs(10), daemon.settle())
        .await
        .expect("daemon did not settle")
        .unwrap()
}

#[tokio::test]
async fn test_initial_load_builds_tag_tree_and_persists_cache() {
    let dir = TempDir::new().unwrap();
    write_settings(dir.path(), r#""showTags": true"#, 1_000);
    write_note(dir.path(), "a.md", "---\ntags: [project/rust]\n---\nFirst note #idea", 1_000);
    write_note(dir.path(), "notes/b.md", "Second note #project/rust", 1_000);
    write_note(dir.path(), "c.md", "No tags here", 1_000);
    write_note(dir.path(), "img.png", "", 1_000);

    let daemon = open_daemon(dir.path()).await;
    daemon.start(false).await.unwrap();
    let tree = settle(&daemon).await;

    let rust = tree.find("project/rust").expect("nested tag");
    assert_eq!(rust.note_count, 2);
    assert_eq!(tree.find("project").unwrap().total_count, 2);
    assert_eq!(tree.find("idea").unwrap().note_count, 1);
    assert_eq!(tree.untagged_count, 1);

    let record = daemon.context().record("c.md").await.unwrap().unwrap();
    assert_eq!(record.preview.as_deref(), Some("No tags here"));
    assert_eq!(record.tags, Some(vec![]));
    daemon.shutdown();
    drop(daemon);

    // A second run finds everything cached and fresh
    let store = JsonStore::open(JsonStore::cache_path(dir.path())).await;
    assert_eq!(store.len(), 4);
    let reopened = open_daemon(dir.path()).await;
    reopened.start(false).await.unwrap();
    let tree = settle(&reopened).await;
    assert_eq!(tree.find("project/rust").unwrap().note_count, 2);
    let needing = reopened
        .context()
        .store()
        .files_needing_content(ContentType::Tags)
        .await
        .unwrap();
    // Tags are only generated for Markdown
    assert_eq!(needing, HashSet::from(["img.png".to_string()]));
}

#[tokio::test]
async fn test_fs_batches_update_the_cache() {
    let dir = TempDir::new().unwrap();
    write_settings(dir.path(), r#""showTags": true"#, 1_000);
    write_note(dir.path(), "a.md", "Plain", 1_000);
    write_note(dir.path(), "b.md", "Tagged #keep", 1_000);

    let daemon = open_daemon(dir.path()).await;
    daemon.start(false).await.unwrap();
    settle(&daemon).await;

    // Modify
    write_note(dir.path(), "a.md", "Now tagged #fresh", 2_000);
    daemon.apply_fs_batch(&[changed("a.md")]).await;
    let tree = settle(&daemon).await;
    assert_eq!(tree.find("fresh").unwrap().note_count, 1);
    let record = daemon.context().record("a.md").await.unwrap().unwrap();
    assert_eq!(record.mtime, 2_000_000);

    // Move keeps the cached content under the new path
    std::fs::create_dir_all(dir.path().join("archive")).unwrap();
    std::fs::rename(dir.path().join("b.md"), dir.path().join("archive/b.md")).unwrap();
    daemon
        .apply_fs_batch(&[removed("b.md"), changed("archive/b.md")])
        .await;
    let tree = settle(&daemon).await;
    assert!(daemon.context().record("b.md").await.unwrap().is_none());
    let moved = daemon.context().record("archive/b.md").await.unwrap().unwrap();
    assert_eq!(moved.tags, Some(vec!["keep".to_string()]));
    assert!(tree.find("keep").unwrap().notes.contains("archive/b.md"));

    // Delete
    std::fs::remove_file(dir.path().join("a.md")).unwrap();
    daemon.apply_fs_batch(&[removed("a.md")]).await;
    let tree = settle(&daemon).await;
    assert!(tree.find("fresh").is_none());
    assert!(daemon.context().record("a.md").await.unwrap().is_none());
}

#[tokio::test]
async fn test_settings_file_edits_are_applied() {
    let dir = TempDir::new().unwrap();
    write_settings(dir.path(), r#""hiddenTags": []"#, 1_000);
    write_note(dir.path(), "a.md", "#draft #final", 1_000);

    let mut daemon = open_daemon(dir.path()).await;
    daemon.start(false).await.unwrap();
    let tree = settle(&daemon).await;
    assert!(tree.find("draft").is_some());

    assert!(!daemon.reload_settings_if_changed(), "unchanged file");

    write_settings(dir.path(), r#""hiddenTags": ["draft"]"#, 2_000);
    assert!(daemon.reload_settings_if_changed());
    let tree = settle(&daemon).await;

    assert!(tree.find("draft").is_none());
    assert!(tree.find("final").is_some());
    assert_eq!(daemon.context().settings().hidden_tags, vec!["draft"]);
}

#[tokio::test]
async fn test_rebuild_regenerates_from_scratch() {
    let dir = TempDir::new().unwrap();
    write_note(dir.path(), "a.md", "Hello #one", 1_000);

    let daemon = open_daemon(dir.path()).await;
    daemon.start(false).await.unwrap();
    settle(&daemon).await;
    drop(daemon);

    let daemon = open_daemon(dir.path()).await;
    daemon.start(true).await.unwrap();
    let tree = settle(&daemon).await;

    assert!(daemon.context().is_storage_ready());
    assert!(!daemon.context().is_stopped());
    assert_eq!(tree.find("one").unwrap().note_count, 1);
}
