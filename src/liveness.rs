//! Node liveness poller.
//!
//! Booting nodes are probed on a short interval, everything else on a long
//! one. A node that turns ready gets a full reconciliation from `/`.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::logger::Logger;
use crate::model::{LivenessState, NodeId};
use crate::reconcile::Reconciler;
use crate::remote::RemoteClient;
use crate::store::CacheStore;

#[derive(Debug)]
pub struct PollResult {
    pub node_id: NodeId,
    pub previous: LivenessState,
    pub current: LivenessState,
    /// Reconciliation started because the node became ready
    pub reconcile: Option<JoinHandle<()>>,
}

impl PollResult {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

pub struct LivenessPoller {
    store: Arc<CacheStore>,
    client: Arc<dyn RemoteClient>,
    reconciler: Arc<Reconciler>,
    logger: Arc<dyn Logger>,
    interval: Duration,
    booting_interval: Duration,
}

impl LivenessPoller {
    pub fn new(
        store: Arc<CacheStore>,
        client: Arc<dyn RemoteClient>,
        reconciler: Arc<Reconciler>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            store,
            client,
            reconciler,
            logger,
            interval: Duration::from_secs(20),
            booting_interval: Duration::from_secs(2),
        }
    }

    pub fn with_intervals(mut self, interval: Duration, booting_interval: Duration) -> Self {
        self.interval = interval;
        self.booting_interval = booting_interval;
        self
    }

    /// Probe one node. An inconclusive probe keeps the last known state.
    pub async fn poll_node(&self, node_id: &str) -> Option<PollResult> {
        let node = self.store.node(node_id)?;
        let probed = self.client.ping(&node.address).await;
        let current = if probed == LivenessState::Unknown {
            node.liveness
        } else {
            probed
        };
        let previous = self.store.set_liveness(node_id, current)?;
        let mut result = PollResult {
            node_id: node.id.clone(),
            previous,
            current,
            reconcile: None,
        };
        if !result.changed() {
            return Some(result);
        }
        self.logger.liveness(&node.id, previous, current);
        if current == LivenessState::Ready {
            let reconciler = Arc::clone(&self.reconciler);
            let logger = Arc::clone(&self.logger);
            let node_ref = node.node_ref();
            result.reconcile = Some(tokio::spawn(async move {
                if let Err(e) = reconciler.reconcile(&node_ref, "/").await {
                    logger.error("reconcile", &node_ref.id, &e.to_string());
                }
            }));
        }
        Some(result)
    }

    /// Probe all nodes concurrently, or only those still booting
    pub async fn poll_all(&self, only_booting: bool) -> Vec<PollResult> {
        let ids: Vec<NodeId> = self
            .store
            .nodes()
            .into_iter()
            .filter(|n| !only_booting || n.liveness == LivenessState::Booting)
            .map(|n| n.id)
            .collect();
        join_all(ids.iter().map(|id| self.poll_node(id)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub async fn run(self: Arc<Self>) {
        let mut slow = tokio::time::interval(self.interval);
        let mut fast = tokio::time::interval(self.booting_interval);
        slow.set_missed_tick_behavior(MissedTickBehavior::Delay);
        fast.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = slow.tick() => {
                    self.poll_all(false).await;
                }
                _ = fast.tick() => {
                    self.poll_all(true).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flight::TaskTable;
    use crate::logger::NoopLogger;
    use crate::model::Node;
    use crate::remote::MemoryFleet;

    fn poller() -> (Arc<MemoryFleet>, Arc<CacheStore>, LivenessPoller) {
        let fleet = Arc::new(MemoryFleet::new());
        fleet.add_node("10.0.0.7");
        let store = Arc::new(CacheStore::new());
        store.put_node(Node {
            id: "n7".into(),
            address: "10.0.0.7".into(),
            hardware_id: None,
            display_name: "Foyer".into(),
            liveness: LivenessState::Unknown,
            group_id: "g".into(),
            position: 0,
        });
        let logger: Arc<dyn Logger> = Arc::new(NoopLogger);
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            fleet.clone(),
            Arc::new(TaskTable::new()),
            logger.clone(),
        ));
        let poller = LivenessPoller::new(store.clone(), fleet.clone(), reconciler, logger);
        (fleet, store, poller)
    }

    #[tokio::test]
    async fn becoming_ready_triggers_reconcile() {
        let (fleet, store, poller) = poller();
        fleet.put_file("10.0.0.7", "/", "a.txt", &b"abc"[..], "text/plain");
        let result = poller.poll_node("n7").await.unwrap();
        assert_eq!(result.current, LivenessState::Ready);
        result.reconcile.unwrap().await.unwrap();
        assert_eq!(store.placements_for_node("n7").len(), 1);

        // steady state: no new pass
        let again = poller.poll_node("n7").await.unwrap();
        assert!(!again.changed());
        assert!(again.reconcile.is_none());
    }

    #[tokio::test]
    async fn only_booting_nodes_on_fast_poll() {
        let (fleet, store, poller) = poller();
        fleet.set_state("10.0.0.7", LivenessState::Booting);
        assert!(poller.poll_all(true).await.is_empty());
        let results = poller.poll_all(false).await;
        assert_eq!(results[0].current, LivenessState::Booting);
        assert!(results[0].reconcile.is_none());
        fleet.set_state("10.0.0.7", LivenessState::Unreachable);
        let results = poller.poll_all(true).await;
        assert_eq!(results.len(), 1);
        assert_eq!(store.node("n7").unwrap().liveness, LivenessState::Unreachable);
    }

    #[tokio::test]
    async fn unknown_node_is_ignored() {
        let (_fleet, _store, poller) = poller();
        assert!(poller.poll_node("nope").await.is_none());
    }
}
