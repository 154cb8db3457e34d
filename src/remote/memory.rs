//! In-process fleet: every node is a map of paths to entries.
//!
//! Used by the test-suite and `fleetsync --memory`. Nodes can be switched off,
//! and uploads or downloads can be made to fail, to exercise rollback paths.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ProgressFn, RemoteClient};
use crate::error::RemoteError;
use crate::model::{normalize_dir, FlatEntry, LivenessState, TreeEntry, DIRECTORY_MIME};
use crate::names::mime_for_name;

const DIR_SIZE: u64 = 4096;

#[derive(Clone, Debug)]
enum Entry {
    Dir { created: DateTime<Utc> },
    File { data: Bytes, mime_type: String, created: DateTime<Utc> },
}

#[derive(Debug)]
struct MemNode {
    state: LivenessState,
    /// `/docs/a.txt` -> entry; directories are keyed without trailing slash
    entries: BTreeMap<String, Entry>,
    fail_uploads: bool,
    fail_downloads: bool,
    /// Chunks reported through the progress callback per transfer
    progress_steps: u64,
}

impl MemNode {
    fn new() -> Self {
        Self {
            state: LivenessState::Ready,
            entries: BTreeMap::new(),
            fail_uploads: false,
            fail_downloads: false,
            progress_steps: 4,
        }
    }

    fn dir_exists(&self, dir: &str) -> bool {
        let dir = normalize_dir(dir);
        if dir == "/" {
            return true;
        }
        matches!(self.entries.get(dir.trim_end_matches('/')), Some(Entry::Dir { .. }))
    }

    fn children(&self, dir: &str) -> Vec<(String, &Entry)> {
        let dir = normalize_dir(dir);
        self.entries
            .range(dir.clone()..)
            .take_while(|(k, _)| k.starts_with(&dir))
            .filter(|(k, _)| !k[dir.len()..].contains('/'))
            .map(|(k, e)| (k[dir.len()..].to_string(), e))
            .collect()
    }

    fn tree(&self, dir: &str) -> Vec<TreeEntry> {
        self.children(dir)
            .into_iter()
            .map(|(name, e)| match e {
                Entry::Dir { .. } => {
                    let sub = format!("{}{}/", normalize_dir(dir), name);
                    TreeEntry::dir(name, self.tree(&sub))
                }
                Entry::File { data, .. } => TreeEntry::file(name, data.len() as u64),
            })
            .collect()
    }

    fn mkdirs(&mut self, dir: &str) {
        let mut current = String::new();
        for seg in normalize_dir(dir).split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(seg);
            self.entries
                .entry(current.clone())
                .or_insert(Entry::Dir { created: Utc::now() });
        }
    }

    fn remove_tree(&mut self, full: &str) {
        self.entries.remove(full);
        let prefix = format!("{full}/");
        self.entries.retain(|k, _| !k.starts_with(&prefix));
    }
}

#[derive(Default)]
pub struct MemoryFleet {
    nodes: Mutex<HashMap<String, MemNode>>,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
    tree_listings: AtomicUsize,
    flat_listings: AtomicUsize,
}

impl MemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, address: &str) {
        self.nodes.lock().insert(address.to_string(), MemNode::new());
    }

    pub fn set_state(&self, address: &str, state: LivenessState) {
        if let Some(node) = self.nodes.lock().get_mut(address) {
            node.state = state;
        }
    }

    pub fn fail_uploads(&self, address: &str, fail: bool) {
        if let Some(node) = self.nodes.lock().get_mut(address) {
            node.fail_uploads = fail;
        }
    }

    pub fn fail_downloads(&self, address: &str, fail: bool) {
        if let Some(node) = self.nodes.lock().get_mut(address) {
            node.fail_downloads = fail;
        }
    }

    /// Write a file directly, creating parent directories
    pub fn put_file(&self, address: &str, path: &str, name: &str, data: impl Into<Bytes>, mime_type: &str) {
        if let Some(node) = self.nodes.lock().get_mut(address) {
            node.mkdirs(path);
            node.entries.insert(
                format!("{}{}", normalize_dir(path), name),
                Entry::File {
                    data: data.into(),
                    mime_type: mime_type.to_string(),
                    created: Utc::now(),
                },
            );
        }
    }

    pub fn mkdir(&self, address: &str, dir: &str) {
        if let Some(node) = self.nodes.lock().get_mut(address) {
            node.mkdirs(dir);
        }
    }

    /// Remove a file or directory behind the cache's back
    pub fn remove(&self, address: &str, path: &str, name: &str) {
        if let Some(node) = self.nodes.lock().get_mut(address) {
            node.remove_tree(&format!("{}{}", normalize_dir(path), name));
        }
    }

    pub fn file(&self, address: &str, path: &str, name: &str) -> Option<Bytes> {
        let nodes = self.nodes.lock();
        match nodes.get(address)?.entries.get(&format!("{}{}", normalize_dir(path), name))? {
            Entry::File { data, .. } => Some(data.clone()),
            Entry::Dir { .. } => None,
        }
    }

    pub fn exists(&self, address: &str, path: &str, name: &str) -> bool {
        self.nodes
            .lock()
            .get(address)
            .is_some_and(|n| n.entries.contains_key(&format!("{}{}", normalize_dir(path), name)))
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn tree_listing_count(&self) -> usize {
        self.tree_listings.load(Ordering::SeqCst)
    }

    pub fn flat_listing_count(&self) -> usize {
        self.flat_listings.load(Ordering::SeqCst)
    }

    fn with_ready<T>(
        &self,
        address: &str,
        f: impl FnOnce(&mut MemNode) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(address)
            .ok_or_else(|| RemoteError::unreachable(address, "no route to host"))?;
        if node.state != LivenessState::Ready {
            return Err(RemoteError::unreachable(address, "connection refused"));
        }
        f(node)
    }
}

fn report_in_steps(progress: &ProgressFn, total: u64, steps: u64) {
    let steps = steps.max(1);
    for i in 1..=steps {
        progress(total * i / steps, total);
    }
}

#[async_trait]
impl RemoteClient for MemoryFleet {
    async fn ping(&self, address: &str) -> LivenessState {
        self.nodes
            .lock()
            .get(address)
            .map(|n| n.state)
            .unwrap_or(LivenessState::Unreachable)
    }

    async fn list_tree(&self, address: &str, path: &str) -> Result<Vec<TreeEntry>, RemoteError> {
        self.tree_listings.fetch_add(1, Ordering::SeqCst);
        self.with_ready(address, |node| {
            if !node.dir_exists(path) {
                return Err(RemoteError::missing(address, path));
            }
            Ok(node.tree(path))
        })
    }

    async fn list_flat(&self, address: &str, path: &str) -> Result<Vec<FlatEntry>, RemoteError> {
        self.flat_listings.fetch_add(1, Ordering::SeqCst);
        self.with_ready(address, |node| {
            if !node.dir_exists(path) {
                return Err(RemoteError::missing(address, path));
            }
            Ok(node
                .children(path)
                .into_iter()
                .map(|(name, e)| match e {
                    Entry::Dir { created } => FlatEntry {
                        name,
                        mime_type: DIRECTORY_MIME.to_string(),
                        size: DIR_SIZE,
                        created_at: *created,
                    },
                    Entry::File { data, mime_type, created } => FlatEntry {
                        name,
                        mime_type: mime_type.clone(),
                        size: data.len() as u64,
                        created_at: *created,
                    },
                })
                .collect())
        })
    }

    async fn upload(
        &self,
        address: &str,
        path: &str,
        name: &str,
        data: Bytes,
        progress: ProgressFn,
    ) -> Result<(), RemoteError> {
        let steps = self.with_ready(address, |node| {
            if node.fail_uploads {
                return Err(RemoteError::CommandFailed {
                    address: address.to_string(),
                    code: 500,
                    stderr: "Failed to save file".into(),
                });
            }
            Ok(node.progress_steps)
        })?;
        report_in_steps(&progress, data.len() as u64, steps);
        tokio::task::yield_now().await;
        self.with_ready(address, |node| {
            node.mkdirs(path);
            node.entries.insert(
                format!("{}{}", normalize_dir(path), name),
                Entry::File {
                    mime_type: mime_for_name(name).to_string(),
                    data,
                    created: Utc::now(),
                },
            );
            Ok(())
        })?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download(
        &self,
        address: &str,
        path: &str,
        name: &str,
        _size: u64,
        progress: ProgressFn,
    ) -> Result<Bytes, RemoteError> {
        let (data, steps) = self.with_ready(address, |node| {
            if node.fail_downloads {
                return Err(RemoteError::unreachable(address, "connection reset"));
            }
            match node.entries.get(&format!("{}{}", normalize_dir(path), name)) {
                Some(Entry::File { data, .. }) => Ok((data.clone(), node.progress_steps)),
                _ => Err(RemoteError::missing(address, format!("{path}{name}"))),
            }
        })?;
        report_in_steps(&progress, data.len() as u64, steps);
        tokio::task::yield_now().await;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }

    async fn create_path(&self, address: &str, path: &str, dirs: &[String]) -> Result<(), RemoteError> {
        self.with_ready(address, |node| {
            if !node.dir_exists(path) {
                return Err(RemoteError::missing(address, path));
            }
            node.mkdirs(&format!("{}{}", normalize_dir(path), dirs.join("/")));
            Ok(())
        })
    }

    async fn delete(&self, address: &str, path: &str, names: &[String]) -> Result<(), RemoteError> {
        self.with_ready(address, |node| {
            if !node.dir_exists(path) {
                return Err(RemoteError::missing(address, path));
            }
            for name in names {
                node.remove_tree(&format!("{}{}", normalize_dir(path), name));
            }
            Ok(())
        })
    }

    async fn thumbnail(&self, address: &str, path: &str, name: &str) -> Result<Option<Bytes>, RemoteError> {
        self.with_ready(address, |node| {
            match node.entries.get(&format!("{}{}", normalize_dir(path), name)) {
                Some(Entry::File { data, mime_type, .. }) if super::supports_thumbnail(mime_type) => {
                    // first bytes stand in for a rendered preview
                    Ok(Some(data.slice(..data.len().min(16))))
                }
                _ => Ok(None),
            }
        })
    }
}
