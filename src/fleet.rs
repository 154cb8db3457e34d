//! Fleet facade: wires the cache, reconciler, queue and poller together and
//! owns the node registry.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::fingerprint::PreviewTracker;
use crate::flight::{TaskTable, TransferTask};
use crate::liveness::{LivenessPoller, PollResult};
use crate::log::TransferLog;
use crate::logger::Logger;
use crate::model::{normalize_dir, FileKey, FileRecord, LivenessState, Node, NodeId};
use crate::names::mime_for_name;
use crate::queue::{Coverage, DeleteRequest, Submission, TaskOutcome, TaskQueue};
use crate::reconcile::{FolderDiff, ReconcileReport, Reconciler};
use crate::remote::RemoteClient;
use crate::store::CacheStore;

/// Directories first, then names without regard to case
pub fn sort_records(records: &mut [FileRecord]) {
    records.sort_by(|a, b| {
        b.is_dir()
            .cmp(&a.is_dir())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

pub struct Fleet {
    store: Arc<CacheStore>,
    reconciler: Arc<Reconciler>,
    queue: Arc<TaskQueue>,
    poller: Arc<LivenessPoller>,
    logger: Arc<dyn Logger>,
    previews: PreviewTracker,
    registry_path: Option<PathBuf>,
}

impl Fleet {
    /// In-memory fleet without registry persistence
    pub fn new(config: &FleetConfig, client: Arc<dyn RemoteClient>, logger: Arc<dyn Logger>) -> Self {
        let store = Arc::new(CacheStore::new());
        let tasks = Arc::new(TaskTable::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&client),
            Arc::clone(&tasks),
            Arc::clone(&logger),
        ));
        let mut queue = TaskQueue::new(
            Arc::clone(&store),
            Arc::clone(&client),
            tasks,
            Arc::clone(&reconciler),
            Arc::clone(&logger),
        );
        if config.transfer_log && config.state_dir.is_some() {
            queue = queue.with_transfer_log(TransferLog::new(&config.state_dir()));
        }
        let poller = LivenessPoller::new(
            Arc::clone(&store),
            client,
            Arc::clone(&reconciler),
            Arc::clone(&logger),
        )
        .with_intervals(config.poll_interval(), config.booting_poll_interval());
        Self {
            store,
            reconciler,
            queue: Arc::new(queue),
            poller: Arc::new(poller),
            logger,
            previews: PreviewTracker::default(),
            registry_path: None,
        }
    }

    /// Fleet whose node registry is read from and written to the state dir
    pub fn open(config: &FleetConfig, client: Arc<dyn RemoteClient>, logger: Arc<dyn Logger>) -> Result<Self> {
        let mut config = config.clone();
        if config.state_dir.is_none() {
            config.state_dir = Some(config.state_dir());
        }
        let mut fleet = Self::new(&config, client, logger);
        let path = config.registry_path();
        fleet.store.load_registry(&path)?;
        fleet.registry_path = Some(path);
        Ok(fleet)
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    fn persist(&self) -> Result<()> {
        match &self.registry_path {
            Some(path) => self.store.save_registry(path),
            None => Ok(()),
        }
    }

    // ---- registry ----------------------------------------------------------

    pub fn register_node(
        &self,
        address: &str,
        hardware_id: Option<String>,
        display_name: &str,
        group_id: Option<String>,
    ) -> Result<Node> {
        if self.store.node_by_name(display_name).is_some() {
            return Err(FleetError::NameTaken(display_name.to_string()));
        }
        let group_id = group_id
            .or_else(|| self.store.first_group())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let node = Node {
            id: Uuid::new_v4().to_string(),
            address: address.to_string(),
            hardware_id,
            display_name: display_name.to_string(),
            liveness: LivenessState::Unknown,
            position: self.store.group_size(&group_id) as u32,
            group_id,
        };
        self.store.put_node(node.clone());
        self.persist()?;
        Ok(node)
    }

    pub fn edit_node(
        &self,
        id: &str,
        address: &str,
        hardware_id: Option<String>,
        display_name: &str,
    ) -> Result<Node> {
        let mut node = self
            .store
            .node(id)
            .ok_or_else(|| FleetError::UnknownNode(id.to_string()))?;
        if let Some(other) = self.store.node_by_name(display_name) {
            if other.id != node.id {
                return Err(FleetError::NameTaken(display_name.to_string()));
            }
        }
        if node.address != address {
            node.liveness = LivenessState::Unknown;
        }
        node.address = address.to_string();
        node.hardware_id = hardware_id;
        node.display_name = display_name.to_string();
        self.store.put_node(node.clone());
        self.persist()?;
        Ok(node)
    }

    /// Remove a node with all its placements
    pub fn remove_node(&self, id: &str) -> Result<Vec<FileKey>> {
        let (node, keys) = self
            .store
            .remove_node(id)
            .ok_or_else(|| FleetError::UnknownNode(id.to_string()))?;
        for key in &keys {
            self.logger.placement_removed(&node.id, key);
        }
        self.previews.forget(&node.id);
        self.persist()?;
        Ok(keys)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.store.nodes()
    }

    /// Accepts a node id or a display name
    pub fn find_node(&self, id_or_name: &str) -> Option<Node> {
        self.store
            .node(id_or_name)
            .or_else(|| self.store.node_by_name(id_or_name))
    }

    // ---- read model --------------------------------------------------------

    /// Records in `path` present on any of `node_ids`
    pub fn browse(&self, path: &str, node_ids: &[NodeId]) -> Vec<FileRecord> {
        let path = normalize_dir(path);
        let mut records: Vec<FileRecord> = self
            .store
            .files_in(&path)
            .into_iter()
            .filter(|r| {
                let key = r.key();
                node_ids.iter().any(|id| self.store.placement(id, &key).is_some())
            })
            .collect();
        sort_records(&mut records);
        records
    }

    /// Creation time of `key` per node display name
    pub fn placement_dates(&self, key: &FileKey) -> Vec<(String, DateTime<Utc>)> {
        self.store
            .holders(key)
            .into_iter()
            .filter_map(|id| {
                let node = self.store.node(&id)?;
                let placement = self.store.placement(&id, key)?;
                Some((node.display_name, placement.created_at))
            })
            .collect()
    }

    pub fn missing_and_colliding(&self, key: &FileKey, node_ids: &[NodeId]) -> Coverage {
        self.queue.coverage(key, node_ids)
    }

    pub fn snapshot(&self) -> Vec<TransferTask> {
        self.queue.snapshot()
    }

    /// True when a preview image of `node_id` differs from the last one seen
    pub fn observe_preview(&self, node_id: &str, data: &[u8]) -> bool {
        self.previews.observe(node_id, data)
    }

    // ---- reconciliation ----------------------------------------------------

    pub async fn reconcile_node(&self, id: &str, path: &str) -> Result<ReconcileReport> {
        let node = self
            .store
            .node(id)
            .ok_or_else(|| FleetError::UnknownNode(id.to_string()))?;
        self.reconciler.reconcile(&node.node_ref(), path).await
    }

    /// Reconcile `path` on every ready node
    pub async fn refresh(&self, path: &str) -> Vec<ReconcileReport> {
        let ready: Vec<Node> = self.store.nodes().into_iter().filter(Node::is_ready).collect();
        let passes = ready
            .iter()
            .map(|n| async move { (n.id.clone(), self.reconciler.reconcile(&n.node_ref(), path).await) });
        let mut reports = Vec::new();
        for (id, result) in futures::future::join_all(passes).await {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => self.logger.error("refresh", &id, &e.to_string()),
            }
        }
        reports
    }

    pub async fn poll(&self) -> Vec<PollResult> {
        self.poller.poll_all(false).await
    }

    // ---- transfers ---------------------------------------------------------

    pub fn submit_upload(&self, path: &str, name: &str, data: Bytes, node_ids: &[NodeId]) -> Result<FileKey> {
        self.queue
            .submit_upload(path, name, mime_for_name(name), data, node_ids)
    }

    pub async fn submit_sync(&self, key: &FileKey, node_ids: &[NodeId]) -> Result<Submission> {
        self.queue.submit_sync(key, node_ids).await
    }

    pub async fn delete(&self, node_id: &str, path: &str, names: Vec<String>) -> Result<FolderDiff> {
        self.queue
            .delete(DeleteRequest {
                node_id: node_id.to_string(),
                path: path.to_string(),
                names,
            })
            .await
    }

    pub async fn drain(&self) -> Vec<TaskOutcome> {
        self.queue.drain().await
    }

    /// Forget the cached file state, then keep polling and working the queue
    /// in the background
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.store.reset_cache();
        vec![
            tokio::spawn(Arc::clone(&self.poller).run()),
            tokio::spawn(Arc::clone(&self.queue).run()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::model::DIRECTORY_MIME;
    use crate::remote::MemoryFleet;

    fn fleet() -> (Arc<MemoryFleet>, Fleet) {
        let mem = Arc::new(MemoryFleet::new());
        let fleet = Fleet::new(&FleetConfig::default(), mem.clone(), Arc::new(NoopLogger));
        (mem, fleet)
    }

    #[test]
    fn names_are_unique_and_groups_fill_up() {
        let (_mem, fleet) = fleet();
        let a = fleet.register_node("10.0.0.1", None, "Foyer", None).unwrap();
        let b = fleet.register_node("10.0.0.2", Some("aa:bb".into()), "Mensa", None).unwrap();
        assert_eq!(a.group_id, b.group_id);
        assert_eq!((a.position, b.position), (0, 1));
        assert!(matches!(
            fleet.register_node("10.0.0.3", None, "Foyer", None),
            Err(FleetError::NameTaken(_))
        ));
        assert!(matches!(
            fleet.edit_node(&b.id, "10.0.0.2", None, "Foyer"),
            Err(FleetError::NameTaken(_))
        ));
        let edited = fleet.edit_node(&b.id, "10.0.0.9", None, "Aula").unwrap();
        assert_eq!(edited.liveness, LivenessState::Unknown);
        assert_eq!(fleet.find_node("Aula").unwrap().id, b.id);
    }

    #[test]
    fn records_sort_directories_first() {
        let mut records = vec![
            FileRecord::from(FileKey::new("/", "b.png", 1, "image/png")),
            FileRecord::from(FileKey::new("/", "Zeta", 4096, DIRECTORY_MIME)),
            FileRecord::from(FileKey::new("/", "A.png", 1, "image/png")),
            FileRecord::from(FileKey::new("/", "alpha", 4096, DIRECTORY_MIME)),
        ];
        sort_records(&mut records);
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "Zeta", "A.png", "b.png"]);
    }

    #[tokio::test]
    async fn browse_only_shows_selected_nodes() {
        let (mem, fleet) = fleet();
        let a = fleet.register_node("10.0.0.1", None, "A", None).unwrap();
        let b = fleet.register_node("10.0.0.2", None, "B", None).unwrap();
        mem.add_node("10.0.0.1");
        mem.add_node("10.0.0.2");
        mem.put_file("10.0.0.1", "/", "only-a.png", vec![1u8; 4], "image/png");
        mem.put_file("10.0.0.2", "/", "only-b.png", vec![2u8; 4], "image/png");
        for result in fleet.poll().await {
            if let Some(pass) = result.reconcile {
                pass.await.unwrap();
            }
        }
        assert_eq!(fleet.browse("/", &[a.id.clone()]).len(), 1);
        assert_eq!(fleet.browse("/", &[a.id.clone(), b.id.clone()]).len(), 2);

        let key = FileKey::new("/", "only-a.png", 4, "image/png");
        let dates = fleet.placement_dates(&key);
        assert_eq!(dates.len(), 1);
        assert_eq!(dates[0].0, "A");
    }

    #[test]
    fn preview_changes_are_tracked_per_node() {
        let (_mem, fleet) = fleet();
        assert!(fleet.observe_preview("n1", b"frame"));
        assert!(!fleet.observe_preview("n1", b"frame"));
    }
}
