//! Core records shared by the cache, the reconciler and the transfer queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mime type reported for directories by `file --mime-type`
pub const DIRECTORY_MIME: &str = "inode/directory";

pub type NodeId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessState {
    /// Host does not answer at all
    Unreachable,
    /// Host answers but the node API is not up yet
    Booting,
    Ready,
    Unknown,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LivenessState::Unreachable => "offline",
            LivenessState::Booting => "booting",
            LivenessState::Ready => "online",
            LivenessState::Unknown => "???",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub hardware_id: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub liveness: LivenessState,
    pub group_id: String,
    pub position: u32,
}

impl Node {
    pub fn is_ready(&self) -> bool {
        self.liveness == LivenessState::Ready
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            id: self.id.clone(),
            address: self.address.clone(),
        }
    }
}

/// Id + address pair carried by queued tasks so they survive registry edits
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub id: NodeId,
    pub address: String,
}

/// Identity of a file across the whole fleet.
///
/// Field order matters: the derived ordering sorts by directory first, so all
/// records of one directory form a contiguous range in the cache tables.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

impl FileKey {
    pub fn new(path: impl Into<String>, name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mime_type == DIRECTORY_MIME
    }

    /// Directory path of this record's own contents (only meaningful for directories)
    pub fn child_dir(&self) -> String {
        format!("{}{}/", self.path, self.name)
    }

    pub fn full_path(&self) -> String {
        format!("{}{}", self.path, self.name)
    }

    pub fn loose(&self) -> LooseKey {
        LooseKey {
            path: self.path.clone(),
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} ({} B, {})", self.path, self.name, self.size, self.mime_type)
    }
}

/// A file identity without its size, used while a transfer is still growing the file
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LooseKey {
    pub path: String,
    pub name: String,
    pub mime_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Vec<u8>>,
}

impl FileRecord {
    pub fn key(&self) -> FileKey {
        FileKey::new(self.path.clone(), self.name.clone(), self.size, self.mime_type.clone())
    }

    pub fn is_dir(&self) -> bool {
        self.mime_type == DIRECTORY_MIME
    }
}

impl From<FileKey> for FileRecord {
    fn from(key: FileKey) -> Self {
        FileRecord {
            path: key.path,
            name: key.name,
            size: key.size,
            mime_type: key.mime_type,
            thumbnail: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingKind {
    Upload,
    Download,
    SyncDownload,
    SyncUpload,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadingData {
    pub kind: LoadingKind,
    pub percentage: u8,
    pub bytes_per_second: f64,
    /// `-1.0` until a rate is known
    pub seconds_until_finish: f64,
}

impl LoadingData {
    pub fn starting(kind: LoadingKind) -> Self {
        Self {
            kind,
            percentage: 0,
            bytes_per_second: 0.0,
            seconds_until_finish: -1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub node_id: NodeId,
    pub file_key: FileKey,
    pub created_at: DateTime<Utc>,
    /// Present while a transfer towards (or from) this node is running
    pub loading: Option<LoadingData>,
}

impl Placement {
    pub fn settled(node_id: impl Into<NodeId>, file_key: FileKey, created_at: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            file_key,
            created_at,
            loading: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.loading.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

/// One node of a recursive listing; never persisted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub children: Vec<TreeEntry>,
}

impl TreeEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size,
            children: Vec::new(),
        }
    }

    pub fn dir(name: impl Into<String>, children: Vec<TreeEntry>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            size: 4096,
            children,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Immediate child of a directory as reported by a flat listing
#[derive(Clone, Debug, PartialEq)]
pub struct FlatEntry {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl FlatEntry {
    pub fn to_record(&self, path: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            name: self.name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
            thumbnail: None,
        }
    }
}

/// Normalise a directory path to the `/a/b/` form used as cache key prefix
pub fn normalize_dir(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty() && *s != ".").collect();
    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}/", segments.join("/"))
}

/// Split `/a/b/` into (`/a/`, `b`); the root has no parent
pub fn split_dir(path: &str) -> Option<(String, String)> {
    let normalized = normalize_dir(path);
    let trimmed = normalized.trim_end_matches('/');
    let pos = trimmed.rfind('/')?;
    let name = &trimmed[pos + 1..];
    if name.is_empty() {
        return None;
    }
    Some((trimmed[..=pos].to_string(), name.to_string()))
}
