//! Target Observer
//!
//! Keeps targets moving:
//! - Refreshes the next target of every loaded collection, concurrently
//! - Promotes next → current once every replica holds every next-target
//!   sealed segment
//!
//! Refresh failures are logged and counted; the previous targets stay in
//! place and the checker keeps working against them.

use crate::metrics;
use futures::future::join_all;
use segcoord_core::{CollectionId, CollectionStatus, SegmentId};
use segcoord_metadata::{
    DistributionManager, TargetError, TargetManager, TargetScope, TopologyStore,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Told about every promotion, e.g. to push the new version to shard leaders
pub trait PromotionListener: Send + Sync {
    fn on_promoted(&self, collection_id: CollectionId, version: i64);
}

/// Outcome of one observe round
#[derive(Debug, Default)]
pub struct ObserveResult {
    pub refreshed: Vec<CollectionId>,
    pub promoted: Vec<CollectionId>,
    pub failed: Vec<(CollectionId, String)>,
}

impl ObserveResult {
    pub fn summary(&self) -> String {
        format!(
            "{} refreshed, {} promoted, {} failed",
            self.refreshed.len(),
            self.promoted.len(),
            self.failed.len()
        )
    }
}

pub struct TargetObserver {
    topology: Arc<TopologyStore>,
    dist: Arc<DistributionManager>,
    targets: Arc<TargetManager>,
    refresh_interval: Duration,
    listener: Option<Arc<dyn PromotionListener>>,
}

impl TargetObserver {
    pub fn new(
        topology: Arc<TopologyStore>,
        dist: Arc<DistributionManager>,
        targets: Arc<TargetManager>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            topology,
            dist,
            targets,
            refresh_interval,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn PromotionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Observe on the refresh interval until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.refresh_interval, "Target observer started");

        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let result = self.observe_once(&cancel).await;
                    debug!(summary = %result.summary(), "Observe round complete");
                }
            }
        }

        info!("Target observer stopped");
    }

    /// One refresh-then-promote round over every loaded collection
    #[instrument(skip_all)]
    pub async fn observe_once(&self, cancel: &CancellationToken) -> ObserveResult {
        let collections = self.topology.collections.get_all();
        let mut result = ObserveResult::default();

        let refreshes = collections.iter().map(|&collection_id| async move {
            let partitions = self.topology.collections.get_partitions(collection_id);
            let outcome = self
                .targets
                .update_collection_next_target_with_partitions(collection_id, &partitions, cancel)
                .await;
            (collection_id, outcome)
        });

        for (collection_id, outcome) in join_all(refreshes).await {
            match outcome {
                Ok(()) => result.refreshed.push(collection_id),
                Err(TargetError::Cancelled) => {
                    debug!(collection_id, "Target refresh cancelled");
                }
                Err(e) => {
                    warn!(collection_id, error = %e, "Failed to refresh next target");
                    metrics::record_target_refresh_failure(collection_id);
                    result.failed.push((collection_id, e.to_string()));
                }
            }
        }

        if cancel.is_cancelled() {
            return result;
        }

        for collection_id in collections {
            if self.ready_to_promote(collection_id) && self.promote(collection_id) {
                result.promoted.push(collection_id);
            }
        }
        result
    }

    fn promote(&self, collection_id: CollectionId) -> bool {
        if !self.targets.update_collection_current_target(collection_id) {
            return false;
        }

        let version = self.targets.get_collection_target_version(collection_id);
        if let Err(e) = self
            .topology
            .collections
            .update_status(collection_id, CollectionStatus::Loaded)
        {
            // released while we were promoting
            warn!(collection_id, error = %e, "Could not mark collection loaded");
        }

        metrics::record_target_promotion(collection_id, version);
        if let Some(listener) = &self.listener {
            listener.on_promoted(collection_id, version);
        }
        true
    }

    /// Next target differs from current and is fully placed in every replica
    fn ready_to_promote(&self, collection_id: CollectionId) -> bool {
        if !self.targets.is_next_target_exist(collection_id) {
            return false;
        }

        let target = self.targets.snapshot(collection_id);
        let next = target.target(TargetScope::Next);
        let current = target.target(TargetScope::Current);
        if next.segments() == current.segments() && next.dm_channels() == current.dm_channels() {
            return false;
        }

        let replicas = self.topology.replicas.get_by_collection(collection_id);
        if replicas.is_empty() {
            return false;
        }

        let dist = self.dist.snapshot();
        replicas.iter().all(|replica| {
            let placed: HashSet<SegmentId> = dist
                .segments_by_replica(replica)
                .iter()
                .filter(|s| !s.is_growing())
                .map(|s| s.id)
                .collect();
            let missing = next
                .segments()
                .keys()
                .filter(|id| !placed.contains(id))
                .count();
            if missing > 0 {
                debug!(
                    collection_id,
                    replica_id = replica.id,
                    missing,
                    "Next target not yet available"
                );
            }
            missing == 0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use segcoord_core::{Collection, Replica, Segment, SegmentInfo, VchannelInfo};
    use segcoord_metadata::{StaticBroker, TargetConfig};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(CollectionId, i64)>>);

    impl PromotionListener for Recorder {
        fn on_promoted(&self, collection_id: CollectionId, version: i64) {
            self.0.lock().push((collection_id, version));
        }
    }

    struct Setup {
        broker: Arc<StaticBroker>,
        topology: Arc<TopologyStore>,
        dist: Arc<DistributionManager>,
        targets: Arc<TargetManager>,
        recorder: Arc<Recorder>,
        observer: TargetObserver,
    }

    fn setup() -> Setup {
        let broker = Arc::new(StaticBroker::new());
        broker.set_recovery_info(
            1,
            1,
            vec![VchannelInfo::new(1, "ch-0")],
            vec![SegmentInfo::new(1, 1, 1, "ch-0")],
        );

        let topology = Arc::new(TopologyStore::new());
        topology
            .load_collection(Collection::new(1, vec![1], 1), vec![Replica::new(1, 1, [1])])
            .unwrap();

        let dist = Arc::new(DistributionManager::new());
        let targets = Arc::new(TargetManager::new(broker.clone(), TargetConfig::default()));
        let recorder = Arc::new(Recorder::default());
        let observer = TargetObserver::new(
            topology.clone(),
            dist.clone(),
            targets.clone(),
            Duration::from_millis(100),
        )
        .with_listener(recorder.clone());

        Setup {
            broker,
            topology,
            dist,
            targets,
            recorder,
            observer,
        }
    }

    #[tokio::test]
    async fn test_refresh_without_placement_does_not_promote() {
        let s = setup();
        let result = s.observer.observe_once(&CancellationToken::new()).await;

        assert_eq!(result.refreshed, vec![1]);
        assert!(result.promoted.is_empty());
        assert!(s.targets.is_next_target_exist(1));
        assert_eq!(s.targets.get_collection_target_version(1), 0);
    }

    #[tokio::test]
    async fn test_promote_once_placed() {
        let s = setup();
        s.observer.observe_once(&CancellationToken::new()).await;
        s.dist
            .segment_dist
            .update(1, vec![Segment::new(1, 1, 1, 1, 1, "ch-0")]);

        let result = s.observer.observe_once(&CancellationToken::new()).await;
        assert_eq!(result.promoted, vec![1]);
        assert_eq!(s.targets.get_collection_target_version(1), 1);
        assert_eq!(
            s.topology.collections.get(1).unwrap().status,
            CollectionStatus::Loaded
        );
        assert_eq!(*s.recorder.0.lock(), vec![(1, 1)]);

        // nothing new in the next target, nothing to promote
        let result = s.observer.observe_once(&CancellationToken::new()).await;
        assert!(result.promoted.is_empty());
        assert_eq!(s.targets.get_collection_target_version(1), 1);
    }

    #[tokio::test]
    async fn test_empty_next_target_is_promoted() {
        let s = setup();
        s.dist
            .segment_dist
            .update(1, vec![Segment::new(1, 1, 1, 1, 1, "ch-0")]);
        s.observer.observe_once(&CancellationToken::new()).await;
        assert_eq!(s.targets.get_collection_target_version(1), 1);

        // the only segment was dropped upstream
        s.broker
            .set_recovery_info(1, 1, vec![VchannelInfo::new(1, "ch-0")], vec![]);
        let result = s.observer.observe_once(&CancellationToken::new()).await;

        assert_eq!(result.promoted, vec![1]);
        assert_eq!(s.targets.get_collection_target_version(1), 2);
        assert!(s
            .targets
            .get_segments_by_collection(1, TargetScope::Current)
            .is_empty());
        assert_eq!(*s.recorder.0.lock(), vec![(1, 1), (1, 2)]);

        // stays put once current matches the empty next target
        let result = s.observer.observe_once(&CancellationToken::new()).await;
        assert!(result.promoted.is_empty());
        assert_eq!(s.targets.get_collection_target_version(1), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_is_reported_not_raised() {
        let s = setup();
        s.broker.set_unavailable(true);

        let result = s.observer.observe_once(&CancellationToken::new()).await;
        assert!(result.refreshed.is_empty());
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].0, 1);
        assert!(!s.targets.is_next_target_exist(1));
    }

    #[tokio::test]
    async fn test_cancelled_round_skips_promotion() {
        let s = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = s.observer.observe_once(&cancel).await;
        assert!(result.refreshed.is_empty());
        assert!(result.failed.is_empty());
        assert!(result.promoted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let s = setup();
        let cancel = CancellationToken::new();

        let observer = Arc::new(s.observer);
        let handle = tokio::spawn({
            let observer = observer.clone();
            let cancel = cancel.clone();
            async move { observer.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(s.targets.is_next_target_exist(1));
    }
}
