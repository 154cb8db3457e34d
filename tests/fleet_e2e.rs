use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use fleetsync::config::FleetConfig;
use fleetsync::error::{FleetError, RemoteError};
use fleetsync::fleet::Fleet;
use fleetsync::flight::TaskState;
use fleetsync::log::{TransferLog, TransferStatus};
use fleetsync::logger::NoopLogger;
use fleetsync::model::{FileKey, FlatEntry, LivenessState, NodeId, TreeEntry, DIRECTORY_MIME};
use fleetsync::remote::{MemoryFleet, ProgressFn, RemoteClient};

/// Registers one memory node per name; the name doubles as address
fn setup(names: &[&str]) -> (Arc<MemoryFleet>, Fleet, Vec<NodeId>) {
    let mem = Arc::new(MemoryFleet::new());
    let fleet = Fleet::new(&FleetConfig::default(), mem.clone(), Arc::new(NoopLogger));
    let ids = names
        .iter()
        .map(|name| {
            mem.add_node(name);
            fleet.register_node(name, None, name, None).unwrap().id
        })
        .collect();
    (mem, fleet, ids)
}

/// Poll every node and wait for the reconciliation triggered by coming online
async fn bring_online(fleet: &Fleet) {
    for result in fleet.poll().await {
        if let Some(pass) = result.reconcile {
            pass.await.unwrap();
        }
    }
}

#[tokio::test]
async fn file_on_node_shows_up_after_reconcile() {
    let (mem, fleet, ids) = setup(&["A"]);
    mem.put_file("A", "/", "a.txt", &b"hello"[..], "text/plain");
    bring_online(&fleet).await;

    let listed = fleet.browse("/", &ids);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "a.txt");
    assert_eq!(listed[0].size, 5);
    let key = FileKey::new("/", "a.txt", 5, "text/plain");
    assert!(fleet.store().placement(&ids[0], &key).unwrap().is_settled());
}

#[tokio::test]
async fn sync_downloads_once_and_fans_out() {
    let (mem, fleet, ids) = setup(&["A", "B", "C"]);
    let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
    mem.put_file("A", "/", "f.mp4", payload.clone(), "video/mp4");
    bring_online(&fleet).await;

    let key = FileKey::new("/", "f.mp4", 5000, "video/mp4");
    let coverage = fleet.missing_and_colliding(&key, &ids);
    assert_eq!(coverage.missing, ids[1..].to_vec());
    assert!(coverage.colliding.is_empty());

    let submission = fleet.submit_sync(&key, &ids).await.unwrap();
    assert_eq!(submission.queued, vec![key.clone()]);
    let queued = fleet.snapshot();
    assert_eq!(queued[0].state, TaskState::Pending);
    assert!(!queued[0].summary().is_loading);

    let outcomes = fleet.drain().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].state, TaskState::Completed);
    assert_eq!(mem.download_count(), 1);
    assert_eq!(mem.upload_count(), 2);
    for (node, id) in ["B", "C"].iter().zip(&ids[1..]) {
        assert_eq!(mem.file(node, "/", "f.mp4").unwrap(), Bytes::from(payload.clone()));
        assert!(fleet.store().placement(id, &key).unwrap().is_settled());
    }
    assert_eq!(fleet.placement_dates(&key).len(), 3);

    fleet.reconciler().wait_thumbnails().await;
    assert!(fleet.store().file(&key).unwrap().thumbnail.is_some());
}

#[tokio::test]
async fn removed_file_disappears_on_refresh() {
    let (mem, fleet, ids) = setup(&["A"]);
    for name in ["1.pdf", "2.pdf", "3.pdf"] {
        mem.put_file("A", "/docs/", name, vec![1u8; 10], "application/pdf");
    }
    bring_online(&fleet).await;
    assert_eq!(fleet.browse("/docs/", &ids).len(), 3);

    mem.remove("A", "/docs/", "2.pdf");
    let reports = fleet.refresh("/").await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].removed, 1);
    assert_eq!(reports[0].changed_paths, vec!["/docs/".to_string()]);
    let names: Vec<String> = fleet.browse("/docs/", &ids).into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["1.pdf", "3.pdf"]);
}

#[tokio::test]
async fn second_refresh_changes_nothing() {
    let (mem, fleet, _ids) = setup(&["A"]);
    mem.put_file("A", "/x/y/", "deep.png", vec![0u8; 3], "image/png");
    mem.put_file("A", "/", "top.png", vec![0u8; 4], "image/png");
    bring_online(&fleet).await;
    let flat_before = mem.flat_listing_count();

    let reports = fleet.refresh("/").await;
    assert!(reports[0].changed_paths.is_empty());
    assert_eq!((reports[0].added, reports[0].removed), (0, 0));
    assert_eq!(mem.flat_listing_count(), flat_before);
    assert_eq!(fleet.store().file_count(), 4);
}

#[tokio::test]
async fn second_sync_of_queued_file_is_rejected() {
    let (mem, fleet, ids) = setup(&["A", "B"]);
    mem.put_file("A", "/", "f.png", vec![5u8; 20], "image/png");
    bring_online(&fleet).await;
    let key = FileKey::new("/", "f.png", 20, "image/png");

    fleet.submit_sync(&key, &ids).await.unwrap();
    let err = fleet.submit_sync(&key, &ids).await.unwrap_err();
    assert!(matches!(err, FleetError::DuplicateTaskConflict(_)));
    assert_eq!(fleet.snapshot().len(), 1);
    assert_eq!(fleet.drain().await.len(), 1);
}

#[tokio::test]
async fn failed_upload_leaves_no_trace() {
    let (mem, fleet, ids) = setup(&["A"]);
    bring_online(&fleet).await;
    mem.fail_uploads("A", true);

    let key = fleet
        .submit_upload("/", "clip.mp4", Bytes::from(vec![1u8; 100]), &ids)
        .unwrap();
    assert_eq!(key.mime_type, "video/mp4");
    assert_eq!(fleet.browse("/", &ids).len(), 1);

    let outcome = fleet.drain().await.pop().unwrap();
    assert_eq!(outcome.state, TaskState::Failed);
    assert!(fleet.store().placement(&ids[0], &key).is_none());
    assert!(fleet.store().file(&key).is_none());
    assert!(fleet.browse("/", &ids).is_empty());
}

#[tokio::test]
async fn upload_round_trip_preserves_bytes() {
    let (mem, fleet, ids) = setup(&["A", "B"]);
    mem.mkdir("A", "/media/");
    mem.mkdir("B", "/media/");
    bring_online(&fleet).await;
    let data: Vec<u8> = (0..70_000u32).map(|i| (i * 31 % 251) as u8).collect();

    let key = fleet
        .submit_upload("/media/", "loop.mp4", Bytes::from(data.clone()), &ids)
        .unwrap();
    assert!(fleet.drain().await.iter().all(|o| o.state == TaskState::Completed));
    for node in ["A", "B"] {
        assert_eq!(mem.file(node, "/media/", "loop.mp4").unwrap().as_ref(), data.as_slice());
    }
    // the node's own listing agrees with what the queue recorded
    let reports = fleet.refresh("/").await;
    assert!(reports.iter().all(|r| r.added == 0 && r.removed == 0));
    assert!(fleet.store().placement(&ids[1], &key).unwrap().is_settled());
}

#[tokio::test]
async fn directory_delete_drops_subtree() {
    let (mem, fleet, ids) = setup(&["A"]);
    mem.put_file("A", "/show/", "a.png", vec![1u8; 2], "image/png");
    mem.put_file("A", "/show/sub/", "b.png", vec![1u8; 3], "image/png");
    bring_online(&fleet).await;

    let diff = fleet.delete(&ids[0], "/", vec!["show".into()]).await.unwrap();
    assert_eq!(diff.removed.len(), 4);
    assert!(diff.removed.contains(&FileKey::new("/", "show", 4096, DIRECTORY_MIME)));
    assert!(!mem.exists("A", "/", "show"));
    assert!(fleet.store().placements_for_node(&ids[0]).is_empty());
    assert_eq!(fleet.store().file_count(), 0);
}

#[tokio::test]
async fn removing_a_node_cascades() {
    let (mem, fleet, ids) = setup(&["A", "B"]);
    mem.put_file("A", "/", "only-a.png", vec![1u8; 2], "image/png");
    mem.put_file("B", "/", "shared.png", vec![1u8; 3], "image/png");
    mem.put_file("A", "/", "shared.png", vec![1u8; 3], "image/png");
    bring_online(&fleet).await;

    let removed = fleet.remove_node(&ids[0]).unwrap();
    assert_eq!(removed.len(), 2);
    assert!(fleet.store().file(&FileKey::new("/", "only-a.png", 2, "image/png")).is_none());
    assert!(fleet.store().file(&FileKey::new("/", "shared.png", 3, "image/png")).is_some());
    assert_eq!(fleet.nodes().len(), 1);
}

#[tokio::test]
async fn registry_and_transfer_log_persist() {
    let dir = tempfile::tempdir().unwrap();
    let config = FleetConfig {
        state_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let mem = Arc::new(MemoryFleet::new());
    mem.add_node("10.1.0.1");
    let id = {
        let fleet = Fleet::open(&config, mem.clone(), Arc::new(NoopLogger)).unwrap();
        let node = fleet.register_node("10.1.0.1", Some("b8:27".into()), "Lobby", None).unwrap();
        bring_online(&fleet).await;
        assert_eq!(fleet.store().node(&node.id).unwrap().liveness, LivenessState::Ready);
        fleet
            .submit_upload("/", "hello.txt", Bytes::from_static(b"hi"), &[node.id.clone()])
            .unwrap();
        fleet.drain().await;
        node.id
    };

    let reopened = Fleet::open(&config, mem, Arc::new(NoopLogger)).unwrap();
    let nodes = reopened.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, id);
    assert_eq!(nodes[0].hardware_id.as_deref(), Some("b8:27"));
    assert_eq!(nodes[0].liveness, LivenessState::Unknown);
    assert_eq!(reopened.store().file_count(), 0);

    let entries = TransferLog::new(dir.path()).read_log().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, TransferStatus::Completed);
    assert_eq!(entries[0].completed, vec![id]);
}

/// Holds the next flat listing after it was read until released
struct HeldListing {
    inner: Arc<MemoryFleet>,
    armed: AtomicBool,
    listed: Notify,
    release: Notify,
}

#[async_trait]
impl RemoteClient for HeldListing {
    async fn ping(&self, address: &str) -> LivenessState {
        self.inner.ping(address).await
    }

    async fn list_tree(&self, address: &str, path: &str) -> Result<Vec<TreeEntry>, RemoteError> {
        self.inner.list_tree(address, path).await
    }

    async fn list_flat(&self, address: &str, path: &str) -> Result<Vec<FlatEntry>, RemoteError> {
        let listing = self.inner.list_flat(address, path).await;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.listed.notify_one();
            self.release.notified().await;
        }
        listing
    }

    async fn upload(
        &self,
        address: &str,
        path: &str,
        name: &str,
        data: Bytes,
        progress: ProgressFn,
    ) -> Result<(), RemoteError> {
        self.inner.upload(address, path, name, data, progress).await
    }

    async fn download(
        &self,
        address: &str,
        path: &str,
        name: &str,
        size: u64,
        progress: ProgressFn,
    ) -> Result<Bytes, RemoteError> {
        self.inner.download(address, path, name, size, progress).await
    }

    async fn create_path(&self, address: &str, path: &str, dirs: &[String]) -> Result<(), RemoteError> {
        self.inner.create_path(address, path, dirs).await
    }

    async fn delete(&self, address: &str, path: &str, names: &[String]) -> Result<(), RemoteError> {
        self.inner.delete(address, path, names).await
    }

    async fn thumbnail(&self, address: &str, path: &str, name: &str) -> Result<Option<Bytes>, RemoteError> {
        self.inner.thumbnail(address, path, name).await
    }
}

#[tokio::test]
async fn upload_finishing_during_listing_keeps_its_placement() {
    let mem = Arc::new(MemoryFleet::new());
    mem.add_node("A");
    let client = Arc::new(HeldListing {
        inner: mem.clone(),
        armed: AtomicBool::new(false),
        listed: Notify::new(),
        release: Notify::new(),
    });
    let fleet = Fleet::new(&FleetConfig::default(), client.clone(), Arc::new(NoopLogger));
    let node = fleet.register_node("A", None, "A", None).unwrap();
    bring_online(&fleet).await;

    client.armed.store(true, Ordering::SeqCst);
    let node_ref = node.node_ref();
    let (diff, key) = tokio::join!(fleet.reconciler().update_folder(&node_ref, "/"), async {
        // the listing above is already taken and does not contain the file
        client.listed.notified().await;
        let key = fleet
            .submit_upload("/", "clip.mp4", Bytes::from(vec![4u8; 40]), &[node.id.clone()])
            .unwrap();
        let outcomes = fleet.drain().await;
        assert_eq!(outcomes[0].state, TaskState::Completed);
        client.release.notify_one();
        key
    });

    let diff = diff.unwrap();
    assert!(diff.removed.is_empty());
    assert!(mem.exists("A", "/", "clip.mp4"));
    assert!(fleet.store().placement(&node.id, &key).unwrap().is_settled());
}
