//! Transfer task queue.
//!
//! Planning (`submit_*`) writes the optimistic cache state and enqueues one
//! task per file identity. A single worker runs the tasks oldest first; the
//! destinations of one task are served concurrently. A failed destination
//! loses its placement again, so the cache never claims a file that did not
//! arrive.

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{FleetError, RemoteError, Result};
use crate::flight::{TaskKind, TaskState, TaskTable, TransferTask};
use crate::log::{TransferLog, TransferLogEntry, TransferStatus};
use crate::logger::Logger;
use crate::model::{
    normalize_dir, FileKey, FileRecord, LoadingData, LoadingKind, Node, NodeId, NodeRef, Placement,
};
use crate::names::generate_valid_file_name;
use crate::progress::ProgressMeter;
use crate::reconcile::{FolderDiff, Reconciler};
use crate::remote::{supports_thumbnail, ProgressFn, RemoteClient};
use crate::store::CacheStore;

/// Result of one finished task
#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub key: FileKey,
    pub state: TaskState,
    pub completed: Vec<NodeId>,
    pub failed: Vec<(NodeId, FleetError)>,
}

/// What a sync request turned into
#[derive(Debug, Default)]
pub struct Submission {
    pub queued: Vec<FileKey>,
    /// Leaves skipped because some destination holds different content
    pub collisions: Vec<(FileKey, Vec<NodeId>)>,
    /// Leaves skipped because a task for them already exists
    pub conflicts: Vec<FileKey>,
}

/// Delete request; runs immediately instead of being queued
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub node_id: NodeId,
    pub path: String,
    pub names: Vec<String>,
}

/// Nodes a file is missing on, and nodes holding different content under its name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coverage {
    pub missing: Vec<NodeId>,
    pub colliding: Vec<NodeId>,
}

pub struct TaskQueue {
    store: Arc<CacheStore>,
    client: Arc<dyn RemoteClient>,
    tasks: Arc<TaskTable>,
    reconciler: Arc<Reconciler>,
    logger: Arc<dyn Logger>,
    transfer_log: Option<TransferLog>,
    notify: Notify,
    worker: tokio::sync::Mutex<()>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<CacheStore>,
        client: Arc<dyn RemoteClient>,
        tasks: Arc<TaskTable>,
        reconciler: Arc<Reconciler>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            store,
            client,
            tasks,
            reconciler,
            logger,
            transfer_log: None,
            notify: Notify::new(),
            worker: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_transfer_log(mut self, log: TransferLog) -> Self {
        self.transfer_log = Some(log);
        self
    }

    /// Add a task; a second task for the same key is rejected
    pub fn enqueue(&self, task: TransferTask) -> Result<()> {
        self.tasks.insert(task)?;
        self.notify.notify_one();
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<TransferTask> {
        self.tasks.snapshot()
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    fn ready_nodes(&self, node_ids: &[NodeId]) -> Vec<Node> {
        node_ids
            .iter()
            .filter_map(|id| self.store.node(id))
            .filter(Node::is_ready)
            .collect()
    }

    // ---- upload ------------------------------------------------------------

    /// Plan an upload of `data` into `path` on every ready node of
    /// `node_ids`. The name is sanitised and made unique for the directory.
    pub fn submit_upload(
        &self,
        path: &str,
        name: &str,
        mime_type: &str,
        data: Bytes,
        node_ids: &[NodeId],
    ) -> Result<FileKey> {
        let path = normalize_dir(path);
        let destinations: Vec<NodeRef> = self
            .ready_nodes(node_ids)
            .iter()
            .map(Node::node_ref)
            .collect();
        if destinations.is_empty() {
            return Err(FleetError::NoDestination(format!("{path}{name}")));
        }

        let mut used = self.tasks.names_in(&path);
        for dest in &destinations {
            used.extend(
                self.store
                    .placements_in(&dest.id, &path)
                    .into_iter()
                    .map(|p| p.file_key.name),
            );
        }
        let name = generate_valid_file_name(name, &used);
        let key = FileKey::new(path, name, data.len() as u64, mime_type);

        let now = Utc::now();
        for dest in &destinations {
            self.store.insert_placed(
                FileRecord::from(key.clone()),
                Placement {
                    node_id: dest.id.clone(),
                    file_key: key.clone(),
                    created_at: now,
                    loading: Some(LoadingData::starting(LoadingKind::Upload)),
                },
            );
        }
        let task = TransferTask::new(key.clone(), TaskKind::Upload { data, destinations: destinations.clone() });
        if let Err(e) = self.enqueue(task) {
            for dest in &destinations {
                self.store.remove_placement_tree(&dest.id, &key);
            }
            return Err(e);
        }
        Ok(key)
    }

    // ---- sync --------------------------------------------------------------

    pub fn coverage(&self, key: &FileKey, node_ids: &[NodeId]) -> Coverage {
        let missing: Vec<NodeId> = node_ids
            .iter()
            .filter(|id| self.store.placement(id, key).is_none())
            .cloned()
            .collect();
        let mut colliding: Vec<NodeId> = Vec::new();
        for other in self.store.files_named(&key.path, &key.name) {
            let other_key = other.key();
            if other_key == *key {
                continue;
            }
            for holder in self.store.holders(&other_key) {
                if node_ids.contains(&holder) && !colliding.contains(&holder) {
                    colliding.push(holder);
                }
            }
        }
        Coverage { missing, colliding }
    }

    /// Copy `key` (a file, or a directory with everything below it) from a
    /// node that has it to every other ready node of `node_ids`.
    pub async fn submit_sync(&self, key: &FileKey, node_ids: &[NodeId]) -> Result<Submission> {
        let participants = self.ready_nodes(node_ids);
        let mut submission = Submission::default();
        if !key.is_dir() {
            if let Some(queued) = self.plan_file(key, &participants).await? {
                submission.queued.push(queued);
            }
            return Ok(submission);
        }

        if self.store.file(key).is_none() {
            return Err(FleetError::UnknownFile(key.clone()));
        }
        let prefix = key.child_dir();
        let mut dirs = vec![prefix.clone()];
        let mut leaves = Vec::new();
        for record in self.store.files_below(&prefix) {
            let held = self
                .store
                .holders(&record.key())
                .iter()
                .any(|id| participants.iter().any(|n| &n.id == id));
            if !held {
                continue;
            }
            if record.is_dir() {
                dirs.push(record.key().child_dir());
            } else {
                leaves.push(record.key());
            }
        }
        for dir in &dirs {
            for node in &participants {
                if let Err(e) = self.ensure_path(&node.node_ref(), dir).await {
                    self.logger.error("create_path", &node.id, &e.to_string());
                }
            }
        }
        for leaf in leaves {
            if self.tasks.contains(&leaf) {
                submission.conflicts.push(leaf);
                continue;
            }
            match self.plan_file(&leaf, &participants).await {
                Ok(Some(k)) => submission.queued.push(k),
                Ok(None) | Err(FleetError::NoSource(_)) => {}
                Err(FleetError::CollidingContent { key, nodes }) => submission.collisions.push((key, nodes)),
                Err(FleetError::DuplicateTaskConflict(k)) => submission.conflicts.push(k),
                Err(e) => return Err(e),
            }
        }
        Ok(submission)
    }

    /// Plan one file; `Ok(None)` when every participant already has it
    async fn plan_file(&self, key: &FileKey, participants: &[Node]) -> Result<Option<FileKey>> {
        if self.tasks.contains(key) {
            return Err(FleetError::DuplicateTaskConflict(key.clone()));
        }
        let record = self
            .store
            .file(key)
            .ok_or_else(|| FleetError::UnknownFile(key.clone()))?;
        let source = participants
            .iter()
            .find(|n| {
                self.store
                    .placement(&n.id, key)
                    .is_some_and(|p| p.is_settled())
            })
            .map(Node::node_ref)
            .ok_or_else(|| FleetError::NoSource(key.clone()))?;

        let ids: Vec<NodeId> = participants.iter().map(|n| n.id.clone()).collect();
        let coverage = self.coverage(key, &ids);
        if !coverage.colliding.is_empty() {
            return Err(FleetError::CollidingContent {
                key: key.clone(),
                nodes: coverage.colliding,
            });
        }
        let mut destinations = Vec::new();
        for node in participants.iter().filter(|n| coverage.missing.contains(&n.id)) {
            let dest = node.node_ref();
            match self.ensure_path(&dest, &key.path).await {
                Ok(()) => destinations.push(dest),
                Err(e) => self.logger.error("create_path", &dest.id, &e.to_string()),
            }
        }
        if destinations.is_empty() {
            return Ok(None);
        }

        self.store.set_loading(
            &source.id,
            key,
            Some(LoadingData::starting(LoadingKind::SyncDownload)),
        );
        let now = Utc::now();
        for dest in &destinations {
            self.store.insert_placed(
                record.clone(),
                Placement {
                    node_id: dest.id.clone(),
                    file_key: key.clone(),
                    created_at: now,
                    loading: Some(LoadingData::starting(LoadingKind::SyncUpload)),
                },
            );
        }
        let task = TransferTask::new(
            key.clone(),
            TaskKind::Sync {
                source: source.clone(),
                destinations: destinations.clone(),
            },
        );
        if let Err(e) = self.enqueue(task) {
            for dest in &destinations {
                self.store.remove_placement_tree(&dest.id, key);
            }
            self.store.set_loading(&source.id, key, None);
            return Err(e);
        }
        Ok(Some(key.clone()))
    }

    /// Make sure directory `dir` exists on `dest`, creating the missing tail
    async fn ensure_path(&self, dest: &NodeRef, dir: &str) -> Result<()> {
        let segments: Vec<String> = normalize_dir(dir)
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let mut base = "/".to_string();
        for (i, seg) in segments.iter().enumerate() {
            let present = self
                .store
                .files_named(&base, seg)
                .iter()
                .any(|r| r.is_dir() && self.store.placement(&dest.id, &r.key()).is_some());
            if !present {
                self.client
                    .create_path(&dest.address, &base, &segments[i..])
                    .await?;
                self.reconciler.update_folder(dest, &base).await?;
                return Ok(());
            }
            base = format!("{base}{seg}/");
        }
        Ok(())
    }

    // ---- delete ------------------------------------------------------------

    /// Delete entries on one node right away, then re-read the directory.
    /// Entries that are already gone count as deleted.
    pub async fn delete(&self, req: DeleteRequest) -> Result<FolderDiff> {
        let node = self
            .store
            .node(&req.node_id)
            .ok_or_else(|| FleetError::UnknownNode(req.node_id.clone()))?
            .node_ref();
        let path = normalize_dir(&req.path);
        match self.client.delete(&node.address, &path, &req.names).await {
            Ok(()) => {}
            Err(e) if e.is_missing() => {}
            Err(e) => {
                self.logger.error("delete", &node.id, &e.to_string());
                return Err(e.into());
            }
        }
        self.reconciler.update_folder(&node, &path).await
    }

    // ---- worker ------------------------------------------------------------

    /// Run queued tasks until the queue is empty
    pub async fn drain(&self) -> Vec<TaskOutcome> {
        let _worker = self.worker.lock().await;
        let mut outcomes = Vec::new();
        while let Some(task) = self.tasks.start_next() {
            outcomes.push(self.execute(task).await);
        }
        outcomes
    }

    /// Drain forever, sleeping until something is enqueued
    pub async fn run(self: Arc<Self>) {
        loop {
            let notified = self.notify.notified();
            self.drain().await;
            notified.await;
        }
    }

    fn progress_sink(&self, key: &FileKey, node_id: &str, kind: LoadingKind) -> ProgressFn {
        let meter = ProgressMeter::start(kind);
        let tasks = Arc::clone(&self.tasks);
        let store = Arc::clone(&self.store);
        let logger = Arc::clone(&self.logger);
        let key = key.clone();
        let node_id = node_id.to_string();
        Arc::new(move |done, total| {
            let data = meter.sample(done, total);
            tasks.set_progress(&key, &node_id, data);
            store.set_loading(&node_id, &key, Some(data));
            logger.progress(&node_id, &key, &data);
        })
    }

    async fn push_to(&self, key: &FileKey, dest: &NodeRef, data: Bytes, kind: LoadingKind) -> Result<(), RemoteError> {
        let progress = self.progress_sink(key, &dest.id, kind);
        let result = self
            .client
            .upload(&dest.address, &key.path, &key.name, data, progress)
            .await;
        self.tasks.clear_progress(key, &dest.id);
        match &result {
            Ok(()) => {
                self.store.settle(&dest.id, key, Utc::now());
                self.logger.transfer_done(&dest.id, key, key.size);
            }
            Err(e) => {
                for gone in self.store.remove_placement_tree(&dest.id, key) {
                    self.logger.placement_removed(&dest.id, &gone);
                }
                self.logger.error("upload", &dest.id, &e.to_string());
            }
        }
        result
    }

    async fn fan_out(
        &self,
        key: &FileKey,
        destinations: &[NodeRef],
        data: Bytes,
        kind: LoadingKind,
    ) -> (Vec<NodeId>, Vec<(NodeId, FleetError)>) {
        let results = join_all(
            destinations
                .iter()
                .map(|dest| self.push_to(key, dest, data.clone(), kind)),
        )
        .await;
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for (dest, result) in destinations.iter().zip(results) {
            match result {
                Ok(()) => completed.push(dest.id.clone()),
                Err(e) => failed.push((dest.id.clone(), FleetError::from(e))),
            }
        }
        (completed, failed)
    }

    async fn execute(&self, task: TransferTask) -> TaskOutcome {
        let key = task.key.clone();
        let (source, completed, failed) = match &task.kind {
            TaskKind::Upload { data, destinations } => {
                let (c, f) = self
                    .fan_out(&key, destinations, data.clone(), LoadingKind::Upload)
                    .await;
                (None, c, f)
            }
            TaskKind::Sync { source, destinations } => {
                let progress = self.progress_sink(&key, &source.id, LoadingKind::SyncDownload);
                let downloaded = self
                    .client
                    .download(&source.address, &key.path, &key.name, key.size, progress)
                    .await;
                self.tasks.clear_progress(&key, &source.id);
                self.store.set_loading(&source.id, &key, None);
                match downloaded {
                    Ok(staged) => {
                        let (c, f) = self
                            .fan_out(&key, destinations, staged, LoadingKind::SyncUpload)
                            .await;
                        (Some(source.id.clone()), c, f)
                    }
                    Err(e) => {
                        self.logger.error("download", &source.id, &e.to_string());
                        let failed = destinations
                            .iter()
                            .map(|dest| {
                                for gone in self.store.remove_placement_tree(&dest.id, &key) {
                                    self.logger.placement_removed(&dest.id, &gone);
                                }
                                (dest.id.clone(), FleetError::from(e.clone()))
                            })
                            .collect();
                        (Some(source.id.clone()), Vec::new(), failed)
                    }
                }
            }
        };

        let state = if failed.is_empty() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        self.tasks.finish(&key, state);

        if let Some(first) = completed.first() {
            let wants_thumb = supports_thumbnail(&key.mime_type)
                && self.store.file(&key).is_some_and(|r| r.thumbnail.is_none());
            if let (true, Some(node)) = (wants_thumb, self.store.node(first)) {
                self.reconciler
                    .schedule_thumbnails(node.address, vec![key.clone()]);
            }
        }

        if let Some(log) = &self.transfer_log {
            let status = match (completed.is_empty(), failed.is_empty()) {
                (_, true) => TransferStatus::Completed,
                (false, false) => TransferStatus::PartiallyFailed,
                (true, false) => TransferStatus::Failed,
            };
            let entry = TransferLogEntry {
                timestamp: String::new(),
                task_id: task.id.to_string(),
                kind: task.kind.label().to_string(),
                file: key.clone(),
                source,
                completed: completed.clone(),
                failed: failed.iter().map(|(n, e)| (n.clone(), e.to_string())).collect(),
                status,
                bytes_total: task.bytes_total(),
            }
            .stamped();
            if let Err(e) = log.add_entry(entry) {
                self.logger.error("transfer_log", &key.full_path(), &e.to_string());
            }
        }

        TaskOutcome {
            task_id: task.id,
            key,
            state,
            completed,
            failed,
        }
    }
}
