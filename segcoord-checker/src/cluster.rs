//! In-process cluster
//!
//! Wires the metadata managers together around a [`StaticBroker`], and loads
//! a whole cluster state from a JSON fixture: collections, replicas, recovery
//! info per partition, and the observed distribution.

use segcoord_core::{
    Collection, CollectionId, DmChannel, LeaderView, NodeId, PartitionId, Replica, Result,
    SegcoordError, Segment, SegmentInfo, VchannelInfo,
};
use segcoord_metadata::{
    DistributionManager, StaticBroker, TargetConfig, TargetError, TargetManager, TopologyStore,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Recovery info the broker reports for one partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionRecovery {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    #[serde(default)]
    pub channels: Vec<VchannelInfo>,
    #[serde(default)]
    pub segments: Vec<SegmentInfo>,
}

/// Observed placement as the nodes would report it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionSpec {
    pub segments: Vec<Segment>,
    pub channels: Vec<DmChannel>,
    pub leader_views: Vec<LeaderView>,
}

/// JSON cluster fixture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default)]
    pub collections: Vec<Collection>,
    #[serde(default)]
    pub replicas: Vec<Replica>,
    #[serde(default)]
    pub recovery_info: Vec<PartitionRecovery>,
    #[serde(default)]
    pub distribution: DistributionSpec,
    /// Promote the freshly pulled next target straight to current
    #[serde(default = "default_true")]
    pub promote: bool,
}

fn default_true() -> bool {
    true
}

impl ClusterSpec {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Shared managers of one in-process cluster
pub struct Cluster {
    pub topology: Arc<TopologyStore>,
    pub dist: Arc<DistributionManager>,
    pub targets: Arc<TargetManager>,
    pub broker: Arc<StaticBroker>,
}

impl Cluster {
    pub fn new(target_config: TargetConfig) -> Self {
        let broker = Arc::new(StaticBroker::new());
        Self {
            topology: Arc::new(TopologyStore::new()),
            dist: Arc::new(DistributionManager::new()),
            targets: Arc::new(TargetManager::new(broker.clone(), target_config)),
            broker,
        }
    }

    /// Build a cluster from a fixture; targets are left empty
    pub fn from_spec(spec: &ClusterSpec, target_config: TargetConfig) -> Result<Self> {
        let cluster = Self::new(target_config);

        let mut seen = HashSet::new();
        for collection in &spec.collections {
            if !seen.insert(collection.id) {
                return Err(SegcoordError::Internal(format!(
                    "collection {} listed twice",
                    collection.id
                )));
            }
        }
        if let Some(stray) = spec.replicas.iter().find(|r| !seen.contains(&r.collection_id)) {
            return Err(SegcoordError::CollectionNotFound(stray.collection_id));
        }

        for collection in &spec.collections {
            let replicas = spec
                .replicas
                .iter()
                .filter(|r| r.collection_id == collection.id)
                .cloned()
                .collect();
            cluster
                .topology
                .load_collection(collection.clone(), replicas)?;
        }

        for info in &spec.recovery_info {
            cluster.broker.set_recovery_info(
                info.collection_id,
                info.partition_id,
                info.channels.clone(),
                info.segments.clone(),
            );
        }

        let dist = &spec.distribution;
        for (node, segments) in group_by(&dist.segments, |s| s.node_id) {
            cluster.dist.segment_dist.update(node, segments);
        }
        for (node, channels) in group_by(&dist.channels, |c| c.node_id) {
            cluster.dist.channel_dist.update(node, channels);
        }
        for (leader, views) in group_by(&dist.leader_views, |v| v.id) {
            cluster.dist.leader_views.update(leader, views);
        }

        info!(
            collections = spec.collections.len(),
            replicas = spec.replicas.len(),
            segments = dist.segments.len(),
            "Cluster loaded"
        );
        Ok(cluster)
    }

    /// Pull next targets for every loaded collection, optionally promoting
    pub async fn refresh_targets(
        &self,
        promote: bool,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), TargetError> {
        for collection_id in self.topology.collections.get_all() {
            let partitions = self.topology.collections.get_partitions(collection_id);
            self.targets
                .update_collection_next_target_with_partitions(collection_id, &partitions, cancel)
                .await?;
            if promote {
                self.targets.update_collection_current_target(collection_id);
            }
        }
        Ok(())
    }
}

fn group_by<T: Clone, F: Fn(&T) -> NodeId>(items: &[T], key: F) -> BTreeMap<NodeId, Vec<T>> {
    let mut grouped: BTreeMap<NodeId, Vec<T>> = BTreeMap::new();
    for item in items {
        grouped.entry(key(item)).or_default().push(item.clone());
    }
    grouped
}
