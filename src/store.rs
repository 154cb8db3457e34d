//! Local cache of what file exists where.
//!
//! Three tables live behind one lock: file records keyed by [`FileKey`],
//! placements keyed by `(node, file)` and a reverse index `file -> nodes`.
//! Every operation that creates or removes a placement also maintains the
//! record table inside the same critical section, so readers never observe a
//! record without a placement (or a placement without its record).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::ops::Bound;
use std::path::Path;

use crate::error::{FleetError, Result};
use crate::model::{FileKey, FileRecord, LivenessState, LoadingData, Node, NodeId, Placement};

#[derive(Default)]
struct Tables {
    groups: BTreeMap<String, u32>,
    nodes: BTreeMap<NodeId, Node>,
    files: BTreeMap<FileKey, FileRecord>,
    placements: BTreeMap<(NodeId, FileKey), Placement>,
    holders: BTreeMap<FileKey, BTreeSet<NodeId>>,
}

impl Tables {
    fn unlink(&mut self, node_id: &str, key: &FileKey) -> bool {
        let removed = self
            .placements
            .remove(&(node_id.to_string(), key.clone()))
            .is_some();
        if let Some(set) = self.holders.get_mut(key) {
            set.remove(node_id);
            if set.is_empty() {
                self.holders.remove(key);
            }
        }
        removed
    }

    fn collect(&mut self, key: &FileKey) {
        if !self.holders.contains_key(key) {
            self.files.remove(key);
        }
    }

    /// Keys placed on `node_id` whose directory starts with `prefix`
    fn node_keys_with_prefix(&self, node_id: &str, prefix: &str) -> Vec<FileKey> {
        let start = (node_id.to_string(), FileKey::new(prefix, "", 0, ""));
        self.placements
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|((n, k), _)| n == node_id && k.path.starts_with(prefix))
            .map(|((_, k), _)| k.clone())
            .collect()
    }
}

#[derive(Serialize, Deserialize, Default)]
struct RegistryFile {
    groups: BTreeMap<String, u32>,
    nodes: Vec<Node>,
}

#[derive(Default)]
pub struct CacheStore {
    tables: RwLock<Tables>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- nodes -------------------------------------------------------------

    pub fn put_node(&self, node: Node) {
        let mut t = self.tables.write();
        if !t.groups.contains_key(&node.group_id) {
            let pos = t.groups.len() as u32;
            t.groups.insert(node.group_id.clone(), pos);
        }
        t.nodes.insert(node.id.clone(), node);
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.tables.read().nodes.get(id).cloned()
    }

    pub fn node_by_name(&self, name: &str) -> Option<Node> {
        self.tables
            .read()
            .nodes
            .values()
            .find(|n| n.display_name == name)
            .cloned()
    }

    /// All nodes ordered by group position, then by position inside the group
    pub fn nodes(&self) -> Vec<Node> {
        let t = self.tables.read();
        let mut nodes: Vec<Node> = t.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| (t.groups.get(&n.group_id).copied().unwrap_or(u32::MAX), n.position));
        nodes
    }

    /// First group by position, if any
    pub fn first_group(&self) -> Option<String> {
        let t = self.tables.read();
        t.groups
            .iter()
            .min_by_key(|(_, pos)| **pos)
            .map(|(id, _)| id.clone())
    }

    pub fn group_size(&self, group_id: &str) -> usize {
        self.tables
            .read()
            .nodes
            .values()
            .filter(|n| n.group_id == group_id)
            .count()
    }

    /// Returns the previous state when the node exists
    pub fn set_liveness(&self, id: &str, state: LivenessState) -> Option<LivenessState> {
        let mut t = self.tables.write();
        let node = t.nodes.get_mut(id)?;
        let old = node.liveness;
        node.liveness = state;
        Some(old)
    }

    /// Remove a node with all its placements; records left without any
    /// placement are dropped, and so is the node's group once it is empty.
    pub fn remove_node(&self, id: &str) -> Option<(Node, Vec<FileKey>)> {
        let mut t = self.tables.write();
        let node = t.nodes.remove(id)?;
        let keys = t.node_keys_with_prefix(id, "");
        for key in &keys {
            t.unlink(id, key);
            t.collect(key);
        }
        if !t.nodes.values().any(|n| n.group_id == node.group_id) {
            t.groups.remove(&node.group_id);
        }
        Some((node, keys))
    }

    // ---- records -----------------------------------------------------------

    pub fn file(&self, key: &FileKey) -> Option<FileRecord> {
        self.tables.read().files.get(key).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.tables.read().files.len()
    }

    /// Range scan: every record whose directory is exactly `path`
    pub fn files_in(&self, path: &str) -> Vec<FileRecord> {
        let start = FileKey::new(path, "", 0, "");
        self.tables
            .read()
            .files
            .range(start..)
            .take_while(|(k, _)| k.path == path)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Every record at any depth below the directory `prefix`
    pub fn files_below(&self, prefix: &str) -> Vec<FileRecord> {
        let start = FileKey::new(prefix, "", 0, "");
        self.tables
            .read()
            .files
            .range(start..)
            .take_while(|(k, _)| k.path.starts_with(prefix))
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Records sharing directory and name, whatever their size or type
    pub fn files_named(&self, path: &str, name: &str) -> Vec<FileRecord> {
        let start = FileKey::new(path, name, 0, "");
        self.tables
            .read()
            .files
            .range(start..)
            .take_while(|(k, _)| k.path == path && k.name == name)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn set_thumbnail(&self, key: &FileKey, thumbnail: Vec<u8>) -> bool {
        match self.tables.write().files.get_mut(key) {
            Some(record) => {
                record.thumbnail = Some(thumbnail);
                true
            }
            None => false,
        }
    }

    // ---- placements --------------------------------------------------------

    pub fn placement(&self, node_id: &str, key: &FileKey) -> Option<Placement> {
        self.tables
            .read()
            .placements
            .get(&(node_id.to_string(), key.clone()))
            .cloned()
    }

    pub fn placements_for_node(&self, node_id: &str) -> Vec<Placement> {
        let t = self.tables.read();
        t.node_keys_with_prefix(node_id, "")
            .into_iter()
            .filter_map(|k| t.placements.get(&(node_id.to_string(), k)).cloned())
            .collect()
    }

    /// Placements of one node in exactly one directory
    pub fn placements_in(&self, node_id: &str, path: &str) -> Vec<Placement> {
        let t = self.tables.read();
        let start = (node_id.to_string(), FileKey::new(path, "", 0, ""));
        t.placements
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|((n, k), _)| n == node_id && k.path == path)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Placements of every node in one directory (observer view)
    pub fn placements_under(&self, path: &str) -> Vec<Placement> {
        let t = self.tables.read();
        let start = FileKey::new(path, "", 0, "");
        let mut out = Vec::new();
        for (key, nodes) in t.holders.range(start..).take_while(|(k, _)| k.path == path) {
            for node in nodes {
                if let Some(p) = t.placements.get(&(node.clone(), key.clone())) {
                    out.push(p.clone());
                }
            }
        }
        out
    }

    pub fn holders(&self, key: &FileKey) -> Vec<NodeId> {
        self.tables
            .read()
            .holders
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Upsert the record and add the placement in one step. An existing
    /// thumbnail is kept.
    pub fn insert_placed(&self, record: FileRecord, placement: Placement) {
        let key = record.key();
        let mut t = self.tables.write();
        match t.files.get_mut(&key) {
            Some(existing) => {
                if record.thumbnail.is_some() {
                    existing.thumbnail = record.thumbnail;
                }
            }
            None => {
                t.files.insert(key.clone(), record);
            }
        }
        t.holders
            .entry(key.clone())
            .or_default()
            .insert(placement.node_id.clone());
        t.placements
            .insert((placement.node_id.clone(), key), placement);
    }

    pub fn set_loading(&self, node_id: &str, key: &FileKey, loading: Option<LoadingData>) -> bool {
        let mut t = self.tables.write();
        match t.placements.get_mut(&(node_id.to_string(), key.clone())) {
            Some(p) => {
                p.loading = loading;
                true
            }
            None => false,
        }
    }

    /// Mark a transfer towards `node_id` as confirmed
    pub fn settle(&self, node_id: &str, key: &FileKey, created_at: DateTime<Utc>) -> bool {
        let mut t = self.tables.write();
        match t.placements.get_mut(&(node_id.to_string(), key.clone())) {
            Some(p) => {
                p.loading = None;
                p.created_at = created_at;
                true
            }
            None => false,
        }
    }

    /// Remove a placement; for directories every placement of the same node
    /// below it goes too. Orphaned records are collected in the same step.
    /// Returns the keys whose placement was removed.
    pub fn remove_placement_tree(&self, node_id: &str, key: &FileKey) -> Vec<FileKey> {
        let mut t = self.tables.write();
        if !t.unlink(node_id, key) {
            return Vec::new();
        }
        t.collect(key);
        let mut removed = vec![key.clone()];
        if key.is_dir() {
            for child in t.node_keys_with_prefix(node_id, &key.child_dir()) {
                t.unlink(node_id, &child);
                t.collect(&child);
                removed.push(child);
            }
        }
        removed
    }

    /// Drop every record without a placement; returns how many went
    pub fn collect_orphans(&self) -> usize {
        let mut t = self.tables.write();
        let orphans: Vec<FileKey> = t
            .files
            .keys()
            .filter(|k| !t.holders.contains_key(*k))
            .cloned()
            .collect();
        for key in &orphans {
            t.files.remove(key);
        }
        orphans.len()
    }

    /// Forget every record and placement and mark all nodes unknown. The
    /// cache is rebuilt from the nodes afterwards.
    pub fn reset_cache(&self) {
        let mut t = self.tables.write();
        t.files.clear();
        t.placements.clear();
        t.holders.clear();
        for node in t.nodes.values_mut() {
            node.liveness = LivenessState::Unknown;
        }
    }

    // ---- registry persistence ----------------------------------------------

    pub fn save_registry(&self, path: &Path) -> Result<()> {
        let reg = {
            let t = self.tables.read();
            RegistryFile {
                groups: t.groups.clone(),
                nodes: t.nodes.values().cloned().collect(),
            }
        };
        let dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;
        let data = serde_json::to_vec_pretty(&reg)?;
        // atomic write
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| FleetError::Io(e.error))?;
        Ok(())
    }

    /// Load nodes from disk; liveness always starts as unknown
    pub fn load_registry(&self, path: &Path) -> Result<usize> {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let reg: RegistryFile = serde_json::from_slice(&data)?;
        let mut t = self.tables.write();
        t.groups = reg.groups;
        let count = reg.nodes.len();
        for mut node in reg.nodes {
            node.liveness = LivenessState::Unknown;
            if !t.groups.contains_key(&node.group_id) {
                let pos = t.groups.len() as u32;
                t.groups.insert(node.group_id.clone(), pos);
            }
            t.nodes.insert(node.id.clone(), node);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoadingKind, DIRECTORY_MIME};

    fn node(id: &str) -> Node {
        Node {
            id: id.into(),
            address: format!("10.0.0.{}", id.len()),
            hardware_id: None,
            display_name: id.to_uppercase(),
            liveness: LivenessState::Ready,
            group_id: "g".into(),
            position: 0,
        }
    }

    fn place(store: &CacheStore, node_id: &str, key: &FileKey) {
        store.insert_placed(
            FileRecord::from(key.clone()),
            Placement::settled(node_id, key.clone(), Utc::now()),
        );
    }

    #[test]
    fn range_scans_stay_inside_directory() {
        let store = CacheStore::new();
        let a = FileKey::new("/", "a.txt", 1, "text/plain");
        let b = FileKey::new("/docs/", "b.txt", 2, "text/plain");
        let c = FileKey::new("/docs/old/", "c.txt", 3, "text/plain");
        for k in [&a, &b, &c] {
            place(&store, "n1", k);
        }
        assert_eq!(store.files_in("/").len(), 1);
        assert_eq!(store.files_in("/docs/").len(), 1);
        assert_eq!(store.files_below("/docs/").len(), 2);
        assert_eq!(store.files_below("/").len(), 3);
        assert_eq!(store.placements_in("n1", "/docs/").len(), 1);
        assert_eq!(store.placements_for_node("n1").len(), 3);
        assert!(store.placements_in("n2", "/docs/").is_empty());
    }

    #[test]
    fn removing_last_placement_collects_record() {
        let store = CacheStore::new();
        let key = FileKey::new("/", "a.txt", 100, "text/plain");
        place(&store, "n1", &key);
        place(&store, "n2", &key);
        store.remove_placement_tree("n1", &key);
        assert!(store.file(&key).is_some());
        assert_eq!(store.holders(&key), vec!["n2".to_string()]);
        store.remove_placement_tree("n2", &key);
        assert!(store.file(&key).is_none());
        assert_eq!(store.file_count(), 0);
    }

    #[test]
    fn directory_removal_is_recursive_per_node() {
        let store = CacheStore::new();
        let dir = FileKey::new("/", "docs", 4096, DIRECTORY_MIME);
        let inner = FileKey::new("/docs/", "a.txt", 5, "text/plain");
        let deep = FileKey::new("/docs/x/", "b.txt", 6, "text/plain");
        let sibling = FileKey::new("/", "docsextra.txt", 7, "text/plain");
        for k in [&dir, &inner, &deep, &sibling] {
            place(&store, "n1", k);
        }
        place(&store, "n2", &inner);
        let removed = store.remove_placement_tree("n1", &dir);
        assert_eq!(removed.len(), 3);
        assert!(store.placement("n1", &sibling).is_some());
        // n2 still holds the inner file, so its record survives
        assert!(store.file(&inner).is_some());
        assert!(store.file(&deep).is_none());
    }

    #[test]
    fn thumbnail_survives_upsert() {
        let store = CacheStore::new();
        let key = FileKey::new("/", "p.png", 10, "image/png");
        place(&store, "n1", &key);
        assert!(store.set_thumbnail(&key, vec![1, 2, 3]));
        place(&store, "n2", &key);
        assert_eq!(store.file(&key).unwrap().thumbnail, Some(vec![1, 2, 3]));
    }

    #[test]
    fn loading_and_settle_touch_only_their_row() {
        let store = CacheStore::new();
        let key = FileKey::new("/", "v.mp4", 1000, "video/mp4");
        let then = Utc::now() - chrono::Duration::hours(1);
        store.insert_placed(
            FileRecord::from(key.clone()),
            Placement {
                node_id: "n1".into(),
                file_key: key.clone(),
                created_at: then,
                loading: Some(LoadingData::starting(LoadingKind::Upload)),
            },
        );
        let mut data = LoadingData::starting(LoadingKind::Upload);
        data.percentage = 40;
        assert!(store.set_loading("n1", &key, Some(data)));
        let p = store.placement("n1", &key).unwrap();
        assert_eq!(p.created_at, then);
        assert_eq!(p.loading.unwrap().percentage, 40);
        assert!(store.settle("n1", &key, Utc::now()));
        let p = store.placement("n1", &key).unwrap();
        assert!(p.is_settled());
        assert!(p.created_at > then);
        assert!(!store.set_loading("n2", &key, None));
    }

    #[test]
    fn remove_node_cascades() {
        let store = CacheStore::new();
        store.put_node(node("n1"));
        store.put_node(node("n2"));
        let only_n1 = FileKey::new("/", "a.txt", 1, "text/plain");
        let shared = FileKey::new("/", "b.txt", 1, "text/plain");
        place(&store, "n1", &only_n1);
        place(&store, "n1", &shared);
        place(&store, "n2", &shared);
        let (_, keys) = store.remove_node("n1").unwrap();
        assert_eq!(keys.len(), 2);
        assert!(store.file(&only_n1).is_none());
        assert!(store.file(&shared).is_some());
        assert!(store.node("n1").is_none());
        assert_eq!(store.first_group(), Some("g".to_string()));
        store.remove_node("n2");
        assert_eq!(store.first_group(), None);
    }

    #[test]
    fn registry_round_trip_resets_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/nodes.json");
        let store = CacheStore::new();
        store.put_node(node("n1"));
        store.save_registry(&path).unwrap();

        let restored = CacheStore::new();
        assert_eq!(restored.load_registry(&path).unwrap(), 1);
        let n = restored.node("n1").unwrap();
        assert_eq!(n.liveness, LivenessState::Unknown);
        assert_eq!(n.display_name, "N1");
        assert_eq!(CacheStore::new().load_registry(&dir.path().join("none.json")).unwrap(), 0);
    }

    #[test]
    fn reset_clears_cache_but_keeps_nodes() {
        let store = CacheStore::new();
        store.put_node(node("n1"));
        place(&store, "n1", &FileKey::new("/", "a", 1, "text/plain"));
        store.reset_cache();
        assert_eq!(store.file_count(), 0);
        assert_eq!(store.node("n1").unwrap().liveness, LivenessState::Unknown);
    }
}
