//! Transfer tasks and the table that keeps at most one of them per file.
//!
//! The table is the queue's backing store and is also read by the
//! reconciler, which must not trust sizes of files that are still being
//! written.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::model::{FileKey, LoadingData, LooseKey, NodeId, NodeRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub enum TaskKind {
    /// Bytes held locally, pushed to every destination
    Upload {
        data: Bytes,
        destinations: Vec<NodeRef>,
    },
    /// Pulled once from `source`, then pushed to every destination
    Sync {
        source: NodeRef,
        destinations: Vec<NodeRef>,
    },
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Upload { .. } => "upload",
            TaskKind::Sync { .. } => "sync",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransferTask {
    pub id: Uuid,
    pub key: FileKey,
    pub kind: TaskKind,
    pub state: TaskState,
    /// Per-node loading data; for a sync the source carries the download side
    pub progress: BTreeMap<NodeId, LoadingData>,
}

/// Aggregated view over all per-node progress of one task
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TaskSummary {
    pub is_loading: bool,
    pub total_percentage: u8,
    pub total_seconds_until_finish: f64,
}

impl TransferTask {
    pub fn new(key: FileKey, kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            kind,
            state: TaskState::Pending,
            progress: BTreeMap::new(),
        }
    }

    /// Bytes moved when the task finishes (a sync counts its download too)
    pub fn bytes_total(&self) -> u64 {
        match &self.kind {
            TaskKind::Upload { destinations, .. } => self.key.size * destinations.len() as u64,
            TaskKind::Sync { destinations, .. } => {
                self.key.size * (destinations.len() as u64 + 1)
            }
        }
    }

    pub fn summary(&self) -> TaskSummary {
        if self.progress.is_empty() {
            return TaskSummary {
                is_loading: false,
                total_percentage: 0,
                total_seconds_until_finish: -1.0,
            };
        }
        let sum: u32 = self.progress.values().map(|l| l.percentage as u32).sum();
        let avg = (sum as f64 / self.progress.len() as f64).round() as u8;
        let seconds = if self.progress.values().any(|l| l.seconds_until_finish < 0.0) {
            -1.0
        } else {
            self.progress
                .values()
                .map(|l| l.seconds_until_finish)
                .fold(0.0, f64::max)
        };
        TaskSummary {
            is_loading: true,
            total_percentage: avg,
            total_seconds_until_finish: seconds,
        }
    }
}

#[derive(Default)]
struct Inner {
    order: VecDeque<FileKey>,
    tasks: HashMap<FileKey, TransferTask>,
}

/// FIFO of transfer tasks keyed by file identity
#[derive(Default)]
pub struct TaskTable {
    inner: Mutex<Inner>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the task when one for the same key already exists
    pub fn insert(&self, task: TransferTask) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tasks.contains_key(&task.key) {
            return Err(FleetError::DuplicateTaskConflict(task.key));
        }
        inner.order.push_back(task.key.clone());
        inner.tasks.insert(task.key.clone(), task);
        Ok(())
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        self.inner.lock().tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest pending task, switched to in-flight
    pub fn start_next(&self) -> Option<TransferTask> {
        let mut inner = self.inner.lock();
        let Inner { order, tasks } = &mut *inner;
        let key = order
            .iter()
            .find(|k| tasks.get(*k).is_some_and(|t| t.state == TaskState::Pending))?
            .clone();
        let task = tasks.get_mut(&key)?;
        task.state = TaskState::InFlight;
        Some(task.clone())
    }

    pub fn set_progress(&self, key: &FileKey, node_id: &str, loading: LoadingData) {
        if let Some(task) = self.inner.lock().tasks.get_mut(key) {
            task.progress.insert(node_id.to_string(), loading);
        }
    }

    pub fn clear_progress(&self, key: &FileKey, node_id: &str) {
        if let Some(task) = self.inner.lock().tasks.get_mut(key) {
            task.progress.remove(node_id);
        }
    }

    /// Take a task out of the table once it reached a terminal state
    pub fn finish(&self, key: &FileKey, state: TaskState) -> Option<TransferTask> {
        let mut inner = self.inner.lock();
        inner.order.retain(|k| k != key);
        let mut task = inner.tasks.remove(key)?;
        task.state = state;
        Some(task)
    }

    pub fn keys(&self) -> HashSet<FileKey> {
        self.inner.lock().tasks.keys().cloned().collect()
    }

    /// Identities (ignoring size) of every file some task is writing
    pub fn loose_keys(&self) -> HashSet<LooseKey> {
        self.inner.lock().tasks.keys().map(FileKey::loose).collect()
    }

    /// Names claimed by queued tasks inside one directory
    pub fn names_in(&self, path: &str) -> Vec<String> {
        self.inner
            .lock()
            .tasks
            .keys()
            .filter(|k| k.path == path)
            .map(|k| k.name.clone())
            .collect()
    }

    /// Queue contents in FIFO order
    pub fn snapshot(&self) -> Vec<TransferTask> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|k| inner.tasks.get(k).cloned())
            .collect()
    }
}
