//! Target snapshot manager
//!
//! Desired segment and channel sets per collection, held at two watermarks:
//! `Next` (just pulled from recovery info) and `Current` (promoted once the
//! data is corroborated as available). Targets are immutable `Arc` values
//! replaced wholesale on write; readers clone the `Arc` and never observe a
//! half-applied refresh.

use crate::broker::{Broker, BrokerError, RecoveryInfo};
use parking_lot::RwLock;
use segcoord_core::{
    CollectionId, PartitionId, SegmentId, SegmentInfo, VchannelInfo,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Target refresh errors
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Recovery info for collection {collection_id} partition {partition_id} failed: {source}")]
    Broker {
        collection_id: CollectionId,
        partition_id: PartitionId,
        #[source]
        source: BrokerError,
    },

    #[error("Recovery info for collection {collection_id} partition {partition_id} timed out after {timeout:?}")]
    Timeout {
        collection_id: CollectionId,
        partition_id: PartitionId,
        timeout: Duration,
    },

    #[error("Target refresh cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, TargetError>;

/// Which watermark to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetScope {
    Current,
    Next,
}

/// Desired state of one collection at one watermark
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionTarget {
    segments: BTreeMap<SegmentId, SegmentInfo>,
    dm_channels: BTreeMap<String, VchannelInfo>,
    version: i64,
}

impl CollectionTarget {
    pub fn segments(&self) -> &BTreeMap<SegmentId, SegmentInfo> {
        &self.segments
    }

    pub fn get_segment(&self, segment_id: SegmentId) -> Option<&SegmentInfo> {
        self.segments.get(&segment_id)
    }

    pub fn contains_segment(&self, segment_id: SegmentId) -> bool {
        self.segments.contains_key(&segment_id)
    }

    pub fn dm_channels(&self) -> &BTreeMap<String, VchannelInfo> {
        &self.dm_channels
    }

    pub fn get_dm_channel(&self, channel: &str) -> Option<&VchannelInfo> {
        self.dm_channels.get(channel)
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.dm_channels.is_empty()
    }
}

#[derive(Default, Clone)]
struct TargetEntry {
    current: Arc<CollectionTarget>,
    next: Arc<CollectionTarget>,
    /// A refresh has succeeded at least once; an empty next target is then
    /// a real answer, not a missing one
    next_fetched: bool,
}

/// Both watermarks of one collection, as of one read
#[derive(Debug, Clone, Default)]
pub struct TargetSnapshot {
    pub collection_id: CollectionId,
    current: Arc<CollectionTarget>,
    next: Arc<CollectionTarget>,
}

impl TargetSnapshot {
    pub fn target(&self, scope: TargetScope) -> &CollectionTarget {
        match scope {
            TargetScope::Current => &self.current,
            TargetScope::Next => &self.next,
        }
    }

    pub fn segments(&self, scope: TargetScope) -> &BTreeMap<SegmentId, SegmentInfo> {
        self.target(scope).segments()
    }

    pub fn channels(&self, scope: TargetScope) -> &BTreeMap<String, VchannelInfo> {
        self.target(scope).dm_channels()
    }

    pub fn get_dm_channel(&self, channel: &str, scope: TargetScope) -> Option<&VchannelInfo> {
        self.target(scope).get_dm_channel(channel)
    }

    /// Sealed segments of current ∪ next, ascending by id
    pub fn expected_segments(&self) -> BTreeMap<SegmentId, &SegmentInfo> {
        self.current
            .segments
            .iter()
            .chain(self.next.segments.iter())
            .map(|(id, info)| (*id, info))
            .collect()
    }

    /// Present in either watermark
    pub fn contains_segment(&self, segment_id: SegmentId) -> bool {
        self.current.contains_segment(segment_id) || self.next.contains_segment(segment_id)
    }

    /// Version of the current target
    pub fn version(&self) -> i64 {
        self.current.version
    }
}

/// Target manager configuration
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Upper bound on a single recovery-info call
    pub recovery_info_timeout: Duration,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            recovery_info_timeout: Duration::from_secs(10),
        }
    }
}

pub struct TargetManager {
    broker: Arc<dyn Broker>,
    config: TargetConfig,
    targets: RwLock<HashMap<CollectionId, TargetEntry>>,
}

impl TargetManager {
    pub fn new(broker: Arc<dyn Broker>, config: TargetConfig) -> Self {
        Self {
            broker,
            config,
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Pull recovery info for `partitions` and fold it into the next target
    ///
    /// Every partition is fetched before anything is written: on any error the
    /// previous next target stays exactly as it was.
    #[instrument(skip(self, cancel))]
    pub async fn update_collection_next_target_with_partitions(
        &self,
        collection_id: CollectionId,
        partitions: &[PartitionId],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut fetched = Vec::with_capacity(partitions.len());
        for &partition_id in partitions {
            let info = self
                .pull_recovery_info(collection_id, partition_id, cancel)
                .await?;
            fetched.push((partition_id, info));
        }

        let mut targets = self.targets.write();
        let entry = targets.entry(collection_id).or_default();
        let mut next = (*entry.next).clone();

        for (partition_id, info) in fetched {
            next.segments.retain(|_, s| s.partition_id != partition_id);
            for segment in info.segments {
                next.segments.insert(segment.id, segment);
            }
            for channel in info.channels {
                next.dm_channels.insert(channel.channel_name.clone(), channel);
            }
        }

        debug!(
            collection_id,
            segments = next.segments.len(),
            channels = next.dm_channels.len(),
            "Next target updated"
        );
        entry.next = Arc::new(next);
        entry.next_fetched = true;
        Ok(())
    }

    async fn pull_recovery_info(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<RecoveryInfo> {
        let timeout = self.config.recovery_info_timeout;
        let call = self.broker.get_recovery_info(collection_id, partition_id);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TargetError::Cancelled),
            res = tokio::time::timeout(timeout, call) => match res {
                Ok(Ok(info)) => Ok(info),
                Ok(Err(source)) => {
                    warn!(collection_id, partition_id, error = %source, "Failed to pull recovery info");
                    Err(TargetError::Broker { collection_id, partition_id, source })
                }
                Err(_) => {
                    warn!(collection_id, partition_id, ?timeout, "Recovery info timed out");
                    Err(TargetError::Timeout { collection_id, partition_id, timeout })
                }
            },
        }
    }

    /// Promote next → current, stamping a fresh target version
    ///
    /// Returns false if the collection has no target at all.
    pub fn update_collection_current_target(&self, collection_id: CollectionId) -> bool {
        let mut targets = self.targets.write();
        let Some(entry) = targets.get_mut(&collection_id) else {
            return false;
        };

        let mut current = (*entry.next).clone();
        current.version = entry.current.version + 1;
        info!(
            collection_id,
            version = current.version,
            segments = current.segments.len(),
            "Current target promoted"
        );
        entry.current = Arc::new(current);
        true
    }

    pub fn remove_collection(&self, collection_id: CollectionId) {
        if self.targets.write().remove(&collection_id).is_some() {
            info!(collection_id, "Targets removed");
        }
    }

    /// Drop a partition's segments from both watermarks
    pub fn remove_partition(&self, collection_id: CollectionId, partitions: &[PartitionId]) {
        let mut targets = self.targets.write();
        let Some(entry) = targets.get_mut(&collection_id) else {
            return;
        };

        let strip = |target: &CollectionTarget| {
            let mut target = target.clone();
            target
                .segments
                .retain(|_, s| !partitions.contains(&s.partition_id));
            Arc::new(target)
        };
        entry.current = strip(&entry.current);
        entry.next = strip(&entry.next);
    }

    /// Consistent read of both watermarks; empty targets for unknown collections
    pub fn snapshot(&self, collection_id: CollectionId) -> TargetSnapshot {
        let entry = self
            .targets
            .read()
            .get(&collection_id)
            .cloned()
            .unwrap_or_default();

        TargetSnapshot {
            collection_id,
            current: entry.current,
            next: entry.next,
        }
    }

    pub fn get_segments_by_collection(
        &self,
        collection_id: CollectionId,
        scope: TargetScope,
    ) -> BTreeMap<SegmentId, SegmentInfo> {
        self.snapshot(collection_id).segments(scope).clone()
    }

    pub fn get_dm_channels_by_collection(
        &self,
        collection_id: CollectionId,
        scope: TargetScope,
    ) -> BTreeMap<String, VchannelInfo> {
        self.snapshot(collection_id).channels(scope).clone()
    }

    pub fn get_dm_channel(
        &self,
        collection_id: CollectionId,
        channel: &str,
        scope: TargetScope,
    ) -> Option<VchannelInfo> {
        self.snapshot(collection_id)
            .get_dm_channel(channel, scope)
            .cloned()
    }

    pub fn get_collection_target_version(&self, collection_id: CollectionId) -> i64 {
        self.snapshot(collection_id).version()
    }

    /// True once a next target has been fetched, even if it came back empty
    pub fn is_next_target_exist(&self, collection_id: CollectionId) -> bool {
        self.targets
            .read()
            .get(&collection_id)
            .map(|e| e.next_fetched)
            .unwrap_or(false)
    }

    pub fn collections(&self) -> Vec<CollectionId> {
        let mut ids: Vec<_> = self.targets.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::broker::StaticBroker;

    fn manager_with(broker: Arc<dyn Broker>) -> TargetManager {
        TargetManager::new(
            broker,
            TargetConfig {
                recovery_info_timeout: Duration::from_millis(200),
            },
        )
    }

    #[tokio::test]
    async fn test_next_target_from_recovery_info() {
        let broker = Arc::new(StaticBroker::new());
        broker.set_recovery_info(
            1,
            1,
            vec![VchannelInfo::new(1, "ch-0").with_seek_timestamp(10)],
            vec![SegmentInfo::new(1, 1, 1, "ch-0")],
        );
        let manager = manager_with(broker);

        manager
            .update_collection_next_target_with_partitions(1, &[1], &CancellationToken::new())
            .await
            .unwrap();

        let snapshot = manager.snapshot(1);
        assert!(snapshot.segments(TargetScope::Next).contains_key(&1));
        assert!(snapshot.segments(TargetScope::Current).is_empty());
        assert_eq!(
            snapshot
                .get_dm_channel("ch-0", TargetScope::Next)
                .unwrap()
                .seek_timestamp(),
            10
        );
        assert!(manager.is_next_target_exist(1));
    }

    #[tokio::test]
    async fn test_partition_contribution_replaced() {
        let broker = Arc::new(StaticBroker::new());
        broker.set_recovery_info(1, 1, vec![], vec![SegmentInfo::new(1, 1, 1, "ch")]);
        broker.set_recovery_info(1, 2, vec![], vec![SegmentInfo::new(2, 1, 2, "ch")]);
        let manager = manager_with(broker.clone());
        let cancel = CancellationToken::new();

        manager
            .update_collection_next_target_with_partitions(1, &[1, 2], &cancel)
            .await
            .unwrap();

        // partition 1 compacted segment 1 into segment 3
        broker.set_recovery_info(1, 1, vec![], vec![SegmentInfo::new(3, 1, 1, "ch")]);
        manager
            .update_collection_next_target_with_partitions(1, &[1], &cancel)
            .await
            .unwrap();

        let ids: Vec<_> = manager
            .get_segments_by_collection(1, TargetScope::Next)
            .into_keys()
            .collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_broker_error_leaves_next_target_untouched() {
        let mut broker = MockBroker::new();
        let mut seq = mockall::Sequence::new();
        broker
            .expect_get_recovery_info()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|collection_id, partition_id| {
                Ok(RecoveryInfo {
                    channels: vec![],
                    segments: vec![SegmentInfo::new(1, collection_id, partition_id, "ch")],
                })
            });
        broker
            .expect_get_recovery_info()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|collection_id, partition_id| {
                Ok(RecoveryInfo {
                    channels: vec![],
                    segments: vec![SegmentInfo::new(2, collection_id, partition_id, "ch")],
                })
            });
        broker
            .expect_get_recovery_info()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(BrokerError::Unavailable("datacoord down".to_string())));

        let manager = manager_with(Arc::new(broker));
        let cancel = CancellationToken::new();
        manager
            .update_collection_next_target_with_partitions(1, &[1], &cancel)
            .await
            .unwrap();

        // second partition fails after the first succeeded: nothing is written
        let err = manager
            .update_collection_next_target_with_partitions(1, &[1, 2], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TargetError::Broker { partition_id: 2, .. }));

        let ids: Vec<_> = manager
            .get_segments_by_collection(1, TargetScope::Next)
            .into_keys()
            .collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_info_timeout() {
        let broker = Arc::new(StaticBroker::with_latency(Duration::from_secs(5)));
        let manager = manager_with(broker);

        let err = manager
            .update_collection_next_target_with_partitions(1, &[1], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TargetError::Timeout { collection_id: 1, .. }));
        assert!(!manager.is_next_target_exist(1));
    }

    #[tokio::test]
    async fn test_refresh_cancelled() {
        let broker = Arc::new(StaticBroker::with_latency(Duration::from_secs(5)));
        let manager = manager_with(broker);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager
            .update_collection_next_target_with_partitions(1, &[1], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TargetError::Cancelled));
    }

    #[tokio::test]
    async fn test_promote_copies_next_and_bumps_version() {
        let broker = Arc::new(StaticBroker::new());
        broker.set_recovery_info(1, 1, vec![], vec![SegmentInfo::new(1, 1, 1, "ch")]);
        let manager = manager_with(broker);

        assert!(!manager.update_collection_current_target(1));
        manager
            .update_collection_next_target_with_partitions(1, &[1], &CancellationToken::new())
            .await
            .unwrap();

        assert!(manager.update_collection_current_target(1));
        assert_eq!(manager.get_collection_target_version(1), 1);
        assert!(manager.update_collection_current_target(1));
        assert_eq!(manager.get_collection_target_version(1), 2);

        let snapshot = manager.snapshot(1);
        assert!(snapshot.segments(TargetScope::Current).contains_key(&1));
        assert!(snapshot.segments(TargetScope::Next).contains_key(&1));
    }

    #[tokio::test]
    async fn test_empty_recovery_info_is_a_fetched_next_target() {
        let broker = Arc::new(StaticBroker::new());
        broker.set_recovery_info(1, 1, vec![], vec![SegmentInfo::new(1, 1, 1, "ch")]);
        let manager = manager_with(broker.clone());
        let cancel = CancellationToken::new();
        manager
            .update_collection_next_target_with_partitions(1, &[1], &cancel)
            .await
            .unwrap();
        manager.update_collection_current_target(1);

        // every segment of the partition dropped
        broker.set_recovery_info(1, 1, vec![], vec![]);
        manager
            .update_collection_next_target_with_partitions(1, &[1], &cancel)
            .await
            .unwrap();

        assert!(manager.is_next_target_exist(1));
        assert!(manager.get_segments_by_collection(1, TargetScope::Next).is_empty());

        assert!(manager.update_collection_current_target(1));
        assert_eq!(manager.get_collection_target_version(1), 2);
        assert!(manager.snapshot(1).expected_segments().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_across_refresh() {
        let broker = Arc::new(StaticBroker::new());
        broker.set_recovery_info(1, 1, vec![], vec![SegmentInfo::new(1, 1, 1, "ch")]);
        let manager = manager_with(broker.clone());
        let cancel = CancellationToken::new();
        manager
            .update_collection_next_target_with_partitions(1, &[1], &cancel)
            .await
            .unwrap();

        let before = manager.snapshot(1);
        broker.set_recovery_info(1, 1, vec![], vec![SegmentInfo::new(9, 1, 1, "ch")]);
        manager
            .update_collection_next_target_with_partitions(1, &[1], &cancel)
            .await
            .unwrap();

        assert!(before.contains_segment(1));
        assert!(!before.contains_segment(9));
        assert!(manager.snapshot(1).contains_segment(9));
    }

    #[tokio::test]
    async fn test_remove_partition_and_collection() {
        let broker = Arc::new(StaticBroker::new());
        broker.set_recovery_info(1, 1, vec![], vec![SegmentInfo::new(1, 1, 1, "ch")]);
        broker.set_recovery_info(1, 2, vec![], vec![SegmentInfo::new(2, 1, 2, "ch")]);
        let manager = manager_with(broker);
        manager
            .update_collection_next_target_with_partitions(1, &[1, 2], &CancellationToken::new())
            .await
            .unwrap();
        manager.update_collection_current_target(1);

        manager.remove_partition(1, &[2]);
        let snapshot = manager.snapshot(1);
        assert_eq!(snapshot.expected_segments().len(), 1);
        assert!(snapshot.contains_segment(1));

        manager.remove_collection(1);
        assert!(manager.collections().is_empty());
        assert!(manager.snapshot(1).expected_segments().is_empty());
    }
}
