//! Reconciliation engine.
//!
//! A pass takes one recursive snapshot of a node's tree, finds the
//! directories whose cached contents no longer match, and re-lists only
//! those with a flat listing to compute add/remove diffs. Files that a
//! transfer task is currently writing are left out on both sides, since
//! their size is not final yet.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::{FleetError, Result};
use crate::flight::TaskTable;
use crate::logger::Logger;
use crate::model::{normalize_dir, FileKey, FileRecord, NodeId, NodeRef, Placement, TreeEntry};
use crate::remote::{supports_thumbnail, RemoteClient};
use crate::store::CacheStore;

/// Upper bound on diff rounds over one snapshot
const MAX_ROUNDS: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub node_id: NodeId,
    /// Another pass for the same node was still running
    pub skipped: bool,
    pub changed_paths: Vec<String>,
    pub added: usize,
    pub removed: usize,
    pub failed_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderDiff {
    pub added: Vec<FileKey>,
    pub removed: Vec<FileKey>,
    pub failed_paths: Vec<String>,
}

impl FolderDiff {
    fn absorb(&mut self, other: FolderDiff) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
        self.failed_paths.extend(other.failed_paths);
    }
}

/// Drop every path that lies below another path of the list
pub fn prune_descendants(mut paths: Vec<String>) -> Vec<String> {
    paths.sort();
    paths.dedup();
    let keep: Vec<String> = paths
        .iter()
        .filter(|p| !paths.iter().any(|q| q != *p && p.starts_with(q.as_str())))
        .cloned()
        .collect();
    keep
}

/// Marks a node as being walked; released on drop
struct WalkToken<'a> {
    walking: &'a Mutex<HashSet<NodeId>>,
    node_id: NodeId,
}

impl Drop for WalkToken<'_> {
    fn drop(&mut self) {
        self.walking.lock().remove(&self.node_id);
    }
}

pub struct Reconciler {
    store: Arc<CacheStore>,
    client: Arc<dyn RemoteClient>,
    tasks: Arc<TaskTable>,
    logger: Arc<dyn Logger>,
    walking: Mutex<HashSet<NodeId>>,
    thumbnails: Mutex<Vec<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<CacheStore>,
        client: Arc<dyn RemoteClient>,
        tasks: Arc<TaskTable>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            store,
            client,
            tasks,
            logger,
            walking: Mutex::new(HashSet::new()),
            thumbnails: Mutex::new(Vec::new()),
        }
    }

    fn try_walk(&self, node_id: &str) -> Option<WalkToken<'_>> {
        let mut walking = self.walking.lock();
        if !walking.insert(node_id.to_string()) {
            return None;
        }
        Some(WalkToken {
            walking: &self.walking,
            node_id: node_id.to_string(),
        })
    }

    pub fn is_walking(&self, node_id: &str) -> bool {
        self.walking.lock().contains(node_id)
    }

    /// Bring the cached placements of `node` below `root` in line with the
    /// node's filesystem. Only a lost connection fails the whole pass; other
    /// remote failures are reported per directory.
    pub async fn reconcile(&self, node: &NodeRef, root: &str) -> Result<ReconcileReport> {
        let root = normalize_dir(root);
        let mut report = ReconcileReport {
            node_id: node.id.clone(),
            ..Default::default()
        };
        let Some(_token) = self.try_walk(&node.id) else {
            report.skipped = true;
            return Ok(report);
        };
        self.logger.reconcile_start(&node.id, &root);

        // Tasks that finish while the snapshot is taken stay excluded
        let in_flight_before = self.tasks.keys();
        let live = match self.client.list_tree(&node.address, &root).await {
            Ok(entries) => entries,
            Err(e) if e.is_missing() => Vec::new(),
            Err(e) if e.is_unreachable() => {
                self.logger.error("reconcile", &node.id, &e.to_string());
                return Err(e.into());
            }
            Err(e) => {
                self.logger.error("reconcile", &node.id, &e.to_string());
                report.failed_paths.push(root);
                return Ok(report);
            }
        };

        // Changes below an already-changed directory only show up once that
        // directory is updated, so diff the same snapshot until it is quiet.
        let mut previous: Vec<String> = Vec::new();
        for _ in 0..MAX_ROUNDS {
            let changed = self.changed_directories(&node.id, &root, &live, &in_flight_before);
            if changed.is_empty() || changed == previous {
                break;
            }
            for path in &changed {
                match self.update_folder(node, path).await {
                    Ok(diff) => {
                        report.added += diff.added.len();
                        report.removed += diff.removed.len();
                        report.failed_paths.extend(diff.failed_paths);
                    }
                    Err(e) if e.is_unreachable() => {
                        self.logger.error("reconcile", &node.id, &e.to_string());
                        return Err(e);
                    }
                    Err(e) => {
                        self.logger.error("reconcile", path, &e.to_string());
                        report.failed_paths.push(path.clone());
                    }
                }
            }
            report.changed_paths.extend(changed.iter().cloned());
            previous = changed;
        }
        report.failed_paths.sort();
        report.failed_paths.dedup();

        self.logger
            .reconcile_done(&node.id, report.changed_paths.len(), report.added, report.removed);
        Ok(report)
    }

    /// Directories below `root` whose cached listing for `node_id` differs
    /// from the snapshot; no returned path lies below another.
    pub fn find_changed_directories(&self, node_id: &str, root: &str, live: &[TreeEntry]) -> Vec<String> {
        self.changed_directories(node_id, root, live, &HashSet::new())
    }

    /// As `find_changed_directories`, also excluding the keys of `earlier`
    fn changed_directories(
        &self,
        node_id: &str,
        root: &str,
        live: &[TreeEntry],
        earlier: &HashSet<FileKey>,
    ) -> Vec<String> {
        let mut in_flight = self.tasks.keys();
        in_flight.extend(earlier.iter().cloned());
        let busy: HashSet<(String, String)> = in_flight
            .iter()
            .map(|k| (k.path.clone(), k.name.clone()))
            .collect();
        let mut changed = Vec::new();
        self.walk_level(node_id, &normalize_dir(root), live, &in_flight, &busy, &mut changed);
        prune_descendants(changed)
    }

    fn walk_level(
        &self,
        node_id: &str,
        path: &str,
        live: &[TreeEntry],
        in_flight: &HashSet<FileKey>,
        busy: &HashSet<(String, String)>,
        changed: &mut Vec<String>,
    ) {
        let cached: Vec<FileKey> = self
            .store
            .placements_in(node_id, path)
            .into_iter()
            .map(|p| p.file_key)
            .filter(|k| !in_flight.contains(k))
            .collect();
        let live: Vec<&TreeEntry> = live
            .iter()
            .filter(|e| !busy.contains(&(path.to_string(), e.name.clone())))
            .collect();

        if cached.len() != live.len() {
            changed.push(path.to_string());
            return;
        }

        let mut subdirs = Vec::new();
        for entry in &live {
            let Some(key) = cached.iter().find(|k| k.name == entry.name) else {
                changed.push(path.to_string());
                return;
            };
            if key.is_dir() != entry.is_dir() || (!entry.is_dir() && key.size != entry.size) {
                changed.push(path.to_string());
                return;
            }
            if entry.is_dir() {
                subdirs.push(*entry);
            }
        }
        for dir in subdirs {
            let sub = format!("{}{}/", path, dir.name);
            self.walk_level(node_id, &sub, &dir.children, in_flight, busy, changed);
        }
    }

    /// Re-list one directory of `node` and apply the diff to the cache,
    /// descending into directories that are new to the cache.
    pub fn update_folder<'a>(&'a self, node: &'a NodeRef, path: &'a str) -> BoxFuture<'a, Result<FolderDiff>> {
        async move {
            let path = normalize_dir(path);
            // Placements that show up while the listing runs were written by
            // a transfer the listing may not have seen, so only keys cached
            // before the call can be removed.
            let mut in_flight = self.tasks.keys();
            let mut writing = self.tasks.loose_keys();
            let known: HashSet<FileKey> = self
                .store
                .placements_in(&node.id, &path)
                .into_iter()
                .map(|p| p.file_key)
                .collect();

            let live = match self.client.list_flat(&node.address, &path).await {
                Ok(entries) => entries,
                Err(e) if e.is_missing() => Vec::new(),
                Err(e) => return Err(FleetError::from(e)),
            };

            in_flight.extend(self.tasks.keys());
            writing.extend(self.tasks.loose_keys());
            let cached: HashSet<FileKey> = self
                .store
                .placements_in(&node.id, &path)
                .into_iter()
                .map(|p| p.file_key)
                .filter(|k| !in_flight.contains(k))
                .collect();
            let live_keys: HashSet<FileKey> = live.iter().map(|e| e.to_record(&path).key()).collect();

            let mut diff = FolderDiff::default();
            let mut thumbs = Vec::new();

            for entry in &live {
                let record: FileRecord = entry.to_record(&path);
                let key = record.key();
                if cached.contains(&key) || writing.contains(&key.loose()) {
                    continue;
                }
                let is_dir = record.is_dir();
                if !is_dir && supports_thumbnail(&record.mime_type) {
                    thumbs.push(key.clone());
                }
                self.store
                    .insert_placed(record, Placement::settled(node.id.clone(), key.clone(), entry.created_at));
                self.logger.placement_added(&node.id, &key);
                diff.added.push(key.clone());

                if is_dir {
                    match self.update_folder(node, &key.child_dir()).await {
                        Ok(sub) => diff.absorb(sub),
                        Err(e) if e.is_unreachable() => return Err(e),
                        Err(e) => {
                            self.logger.error("update_folder", &key.child_dir(), &e.to_string());
                            diff.failed_paths.push(key.child_dir());
                        }
                    }
                }
            }

            for key in cached.iter().filter(|k| known.contains(*k) && !live_keys.contains(*k)) {
                for gone in self.store.remove_placement_tree(&node.id, key) {
                    self.logger.placement_removed(&node.id, &gone);
                    diff.removed.push(gone);
                }
            }

            if !thumbs.is_empty() {
                self.schedule_thumbnails(node.address.clone(), thumbs);
            }
            Ok(diff)
        }
        .boxed()
    }

    /// Fetch previews in the background for records that have none yet
    pub fn schedule_thumbnails(&self, address: String, keys: Vec<FileKey>) {
        let store = Arc::clone(&self.store);
        let client = Arc::clone(&self.client);
        let logger = Arc::clone(&self.logger);
        let handle = tokio::spawn(async move {
            for key in keys {
                let needs_thumb = store.file(&key).is_some_and(|r| r.thumbnail.is_none());
                if !needs_thumb {
                    continue;
                }
                match client.thumbnail(&address, &key.path, &key.name).await {
                    Ok(Some(bytes)) => {
                        store.set_thumbnail(&key, bytes.to_vec());
                    }
                    Ok(None) => {}
                    Err(e) => logger.error("thumbnail", &key.full_path(), &e.to_string()),
                }
            }
        });
        let mut handles = self.thumbnails.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Wait for every scheduled thumbnail fetch
    pub async fn wait_thumbnails(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.thumbnails.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flight::{TaskKind, TaskState, TransferTask};
    use crate::logger::NoopLogger;
    use crate::model::DIRECTORY_MIME;
    use bytes::Bytes;
    use crate::remote::MemoryFleet;
    use chrono::Utc;

    fn setup() -> (Arc<MemoryFleet>, Arc<CacheStore>, Arc<TaskTable>, Reconciler, NodeRef) {
        let fleet = Arc::new(MemoryFleet::new());
        fleet.add_node("10.0.0.1");
        let store = Arc::new(CacheStore::new());
        let tasks = Arc::new(TaskTable::new());
        let rec = Reconciler::new(
            store.clone(),
            fleet.clone(),
            tasks.clone(),
            Arc::new(NoopLogger),
        );
        let node = NodeRef {
            id: "a".into(),
            address: "10.0.0.1".into(),
        };
        (fleet, store, tasks, rec, node)
    }

    #[test]
    fn pruning_keeps_only_topmost_paths() {
        let paths = vec![
            "/docs/old/".to_string(),
            "/docs/".to_string(),
            "/docs2/".to_string(),
            "/docs/".to_string(),
        ];
        assert_eq!(prune_descendants(paths), vec!["/docs/".to_string(), "/docs2/".to_string()]);
        assert_eq!(prune_descendants(vec!["/".into(), "/a/".into()]), vec!["/".to_string()]);
    }

    #[tokio::test]
    async fn empty_live_and_empty_cache_is_unchanged() {
        let (_fleet, _store, _tasks, rec, node) = setup();
        assert!(rec.find_changed_directories(&node.id, "/", &[]).is_empty());
        let report = rec.reconcile(&node, "/").await.unwrap();
        assert!(report.changed_paths.is_empty());
    }

    #[tokio::test]
    async fn size_change_marks_only_parent_directory() {
        let (_fleet, store, _tasks, rec, node) = setup();
        let docs = FileKey::new("/", "docs", 4096, DIRECTORY_MIME);
        let a = FileKey::new("/docs/", "a.txt", 5, "text/plain");
        for k in [&docs, &a] {
            store.insert_placed(FileRecord::from(k.clone()), Placement::settled("a", k.clone(), Utc::now()));
        }
        let live = vec![TreeEntry::dir("docs", vec![TreeEntry::file("a.txt", 6)])];
        assert_eq!(rec.find_changed_directories("a", "/", &live), vec!["/docs/".to_string()]);

        let kind_flip = vec![TreeEntry::dir("docs", vec![TreeEntry::dir("a.txt", vec![])])];
        assert_eq!(rec.find_changed_directories("a", "/", &kind_flip), vec!["/docs/".to_string()]);

        let same = vec![TreeEntry::dir("docs", vec![TreeEntry::file("a.txt", 5)])];
        assert!(rec.find_changed_directories("a", "/", &same).is_empty());
    }

    #[tokio::test]
    async fn nested_changes_are_found_in_one_pass() {
        let (fleet, store, _tasks, rec, node) = setup();
        fleet.put_file("10.0.0.1", "/", "top.txt", &b"1"[..], "text/plain");
        fleet.put_file("10.0.0.1", "/docs/", "inner.txt", &b"22"[..], "text/plain");
        rec.reconcile(&node, "/").await.unwrap();

        // change at both levels: / loses a file, /docs/ gains one
        fleet.remove("10.0.0.1", "/", "top.txt");
        fleet.put_file("10.0.0.1", "/docs/", "new.txt", &b"333"[..], "text/plain");
        let report = rec.reconcile(&node, "/").await.unwrap();
        assert_eq!(report.changed_paths, vec!["/".to_string(), "/docs/".to_string()]);
        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(store.placements_in("a", "/docs/").len(), 2);
        assert!(store.placements_in("a", "/").iter().all(|p| p.file_key.name == "docs"));
    }

    #[tokio::test]
    async fn update_folder_is_idempotent() {
        let (fleet, store, _tasks, rec, node) = setup();
        fleet.put_file("10.0.0.1", "/", "a.txt", &b"hello"[..], "text/plain");
        let first = rec.update_folder(&node, "/").await.unwrap();
        assert_eq!(first.added.len(), 1);
        let before = store.placements_for_node("a");
        let second = rec.update_folder(&node, "/").await.unwrap();
        assert!(second.added.is_empty() && second.removed.is_empty());
        assert_eq!(store.placements_for_node("a"), before);
    }

    #[tokio::test]
    async fn file_being_written_is_not_picked_up() {
        let (fleet, store, tasks, rec, node) = setup();
        let key = FileKey::new("/", "clip.mp4", 100, "video/mp4");
        tasks
            .insert(TransferTask::new(
                key.clone(),
                TaskKind::Upload {
                    data: Bytes::from(vec![0u8; 100]),
                    destinations: vec![],
                },
            ))
            .unwrap();
        // only part of the bytes have arrived, so the live size differs
        fleet.put_file("10.0.0.1", "/", "clip.mp4", vec![0u8; 40], "video/mp4");

        let diff = rec.update_folder(&node, "/").await.unwrap();
        assert!(diff.added.is_empty());
        assert!(store.placements_in("a", "/").is_empty());

        tasks.finish(&key, TaskState::Failed);
        let diff = rec.update_folder(&node, "/").await.unwrap();
        assert_eq!(diff.added, vec![FileKey::new("/", "clip.mp4", 40, "video/mp4")]);
    }

    #[tokio::test]
    async fn missing_path_removes_cached_children() {
        let (_fleet, store, _tasks, rec, node) = setup();
        let k = FileKey::new("/gone/", "x.txt", 1, "text/plain");
        store.insert_placed(FileRecord::from(k.clone()), Placement::settled("a", k.clone(), Utc::now()));
        let diff = rec.update_folder(&node, "/gone/").await.unwrap();
        assert_eq!(diff.removed, vec![k.clone()]);
        assert!(store.file(&k).is_none());
    }

    #[tokio::test]
    async fn concurrent_pass_for_same_node_is_skipped() {
        let (_fleet, _store, _tasks, rec, node) = setup();
        let _token = rec.try_walk(&node.id).unwrap();
        assert!(rec.is_walking("a"));
        let report = rec.reconcile(&node, "/").await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn unreachable_node_fails_the_pass() {
        let (fleet, _store, _tasks, rec, node) = setup();
        fleet.set_state("10.0.0.1", crate::model::LivenessState::Unreachable);
        let err = rec.reconcile(&node, "/").await.unwrap_err();
        assert!(err.is_unreachable());
        assert!(!rec.is_walking("a"));
    }

    #[tokio::test]
    async fn thumbnails_are_fetched_for_new_images() {
        let (fleet, store, _tasks, rec, node) = setup();
        fleet.put_file("10.0.0.1", "/", "p.png", &b"\x89PNG-data"[..], "image/png");
        fleet.put_file("10.0.0.1", "/", "n.txt", &b"text"[..], "text/plain");
        rec.reconcile(&node, "/").await.unwrap();
        rec.wait_thumbnails().await;
        let png = store.files_named("/", "p.png").pop().unwrap();
        assert!(png.thumbnail.is_some());
        let txt = store.files_named("/", "n.txt").pop().unwrap();
        assert!(txt.thumbnail.is_none());
    }
}
