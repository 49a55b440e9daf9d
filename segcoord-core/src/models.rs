//! Cluster data model
//!
//! Plain values shared by the topology store, the distribution and target
//! snapshots, and the checker. None of these types carry locks; the managers
//! that own them decide how they are shared.

use crate::{
    CollectionId, NodeId, PartitionId, ReplicaId, SegmentId, Timestamp, INVALID_ID,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// TOPOLOGY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    #[default]
    Loading,
    Loaded,
}

/// A loaded collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub partitions: Vec<PartitionId>,
    #[serde(default = "default_replica_number")]
    pub replica_number: u32,
    #[serde(default)]
    pub status: CollectionStatus,
}

fn default_replica_number() -> u32 {
    1
}

impl Collection {
    pub fn new(id: CollectionId, partitions: Vec<PartitionId>, replica_number: u32) -> Self {
        Self {
            id,
            partitions,
            replica_number,
            status: CollectionStatus::Loading,
        }
    }

    pub fn has_partition(&self, partition_id: PartitionId) -> bool {
        self.partitions.contains(&partition_id)
    }
}

/// An independent copy of a collection spread over a set of nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    pub collection_id: CollectionId,
    pub nodes: BTreeSet<NodeId>,
}

impl Replica {
    pub fn new(
        id: ReplicaId,
        collection_id: CollectionId,
        nodes: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        Self {
            id,
            collection_id,
            nodes: nodes.into_iter().collect(),
        }
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains(&node_id)
    }

    /// Member nodes in ascending order
    pub fn node_list(&self) -> Vec<NodeId> {
        self.nodes.iter().copied().collect()
    }
}

// =============================================================================
// SEGMENTS
// =============================================================================

/// Position on a write channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MsgPosition {
    #[serde(default)]
    pub channel_name: String,
    pub timestamp: Timestamp,
}

impl MsgPosition {
    pub fn at(timestamp: Timestamp) -> Self {
        Self {
            channel_name: String::new(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Still receiving writes; lives on the channel leader
    Growing,
    /// Immutable
    #[default]
    Sealed,
}

/// Logical segment identity as reported by recovery info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub insert_channel: String,
    #[serde(default)]
    pub num_of_rows: i64,
    #[serde(default)]
    pub start_position: Option<MsgPosition>,
}

impl SegmentInfo {
    pub fn new(
        id: SegmentId,
        collection_id: CollectionId,
        partition_id: PartitionId,
        insert_channel: impl Into<String>,
    ) -> Self {
        Self {
            id,
            collection_id,
            partition_id,
            insert_channel: insert_channel.into(),
            num_of_rows: 0,
            start_position: None,
        }
    }
}

/// A physical copy of a segment on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub node_id: NodeId,
    #[serde(default)]
    pub version: i64,
    pub insert_channel: String,
    #[serde(default)]
    pub num_of_rows: i64,
    #[serde(default)]
    pub start_position: Option<MsgPosition>,
    #[serde(default)]
    pub state: SegmentState,
}

impl Segment {
    pub fn new(
        id: SegmentId,
        collection_id: CollectionId,
        partition_id: PartitionId,
        node_id: NodeId,
        version: i64,
        insert_channel: impl Into<String>,
    ) -> Self {
        Self {
            id,
            collection_id,
            partition_id,
            node_id,
            version,
            insert_channel: insert_channel.into(),
            num_of_rows: 0,
            start_position: None,
            state: SegmentState::Sealed,
        }
    }

    /// A not-yet-placed sealed copy of a target segment
    pub fn from_info(info: &SegmentInfo) -> Self {
        Self {
            id: info.id,
            collection_id: info.collection_id,
            partition_id: info.partition_id,
            node_id: INVALID_ID,
            version: 0,
            insert_channel: info.insert_channel.clone(),
            num_of_rows: info.num_of_rows,
            start_position: info.start_position.clone(),
            state: SegmentState::Sealed,
        }
    }

    pub fn growing(mut self, start: Timestamp) -> Self {
        self.state = SegmentState::Growing;
        self.start_position = Some(MsgPosition {
            channel_name: self.insert_channel.clone(),
            timestamp: start,
        });
        self
    }

    pub fn is_growing(&self) -> bool {
        self.state == SegmentState::Growing
    }

    /// Start timestamp, zero when the position is unknown
    pub fn start_timestamp(&self) -> Timestamp {
        self.start_position
            .as_ref()
            .map(|p| p.timestamp)
            .unwrap_or(0)
    }
}

// =============================================================================
// CHANNELS
// =============================================================================

/// Write channel description as reported by recovery info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VchannelInfo {
    pub collection_id: CollectionId,
    pub channel_name: String,
    #[serde(default)]
    pub seek_position: Option<MsgPosition>,
    #[serde(default)]
    pub unflushed_segment_ids: Vec<SegmentId>,
    #[serde(default)]
    pub flushed_segment_ids: Vec<SegmentId>,
}

impl VchannelInfo {
    pub fn new(collection_id: CollectionId, channel_name: impl Into<String>) -> Self {
        Self {
            collection_id,
            channel_name: channel_name.into(),
            seek_position: None,
            unflushed_segment_ids: Vec::new(),
            flushed_segment_ids: Vec::new(),
        }
    }

    pub fn with_seek_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.seek_position = Some(MsgPosition {
            channel_name: self.channel_name.clone(),
            timestamp,
        });
        self
    }

    /// Flush boundary of the channel, zero when unknown
    pub fn seek_timestamp(&self) -> Timestamp {
        self.seek_position
            .as_ref()
            .map(|p| p.timestamp)
            .unwrap_or(0)
    }

    pub fn is_unflushed(&self, segment_id: SegmentId) -> bool {
        self.unflushed_segment_ids.contains(&segment_id)
    }
}

/// A channel assignment: which node watches a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmChannel {
    #[serde(flatten)]
    pub info: VchannelInfo,
    pub node_id: NodeId,
    #[serde(default)]
    pub version: i64,
}

impl DmChannel {
    pub fn new(info: VchannelInfo, node_id: NodeId, version: i64) -> Self {
        Self {
            info,
            node_id,
            version,
        }
    }

    /// Target-side channel, not yet assigned to a node
    pub fn from_info(info: VchannelInfo) -> Self {
        Self::new(info, INVALID_ID, 0)
    }

    pub fn collection_id(&self) -> CollectionId {
        self.info.collection_id
    }

    pub fn channel_name(&self) -> &str {
        &self.info.channel_name
    }
}

// =============================================================================
// LEADER VIEWS
// =============================================================================

/// Where the shard leader routes a sealed segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDist {
    pub node_id: NodeId,
    pub version: i64,
}

/// A channel leader's bookkeeping of which segment copies are live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderView {
    /// Leader node
    pub id: NodeId,
    pub collection_id: CollectionId,
    pub channel: String,
    #[serde(default)]
    pub version: i64,
    /// Sealed segments served through this leader
    #[serde(default)]
    pub segments: BTreeMap<SegmentId, SegmentDist>,
    /// Growing segments held by this leader
    #[serde(default)]
    pub growing_segments: BTreeMap<SegmentId, Segment>,
    /// Current target version the leader has synced to
    #[serde(default)]
    pub target_version: i64,
}

impl LeaderView {
    pub fn new(id: NodeId, collection_id: CollectionId, channel: impl Into<String>) -> Self {
        Self {
            id,
            collection_id,
            channel: channel.into(),
            version: 0,
            segments: BTreeMap::new(),
            growing_segments: BTreeMap::new(),
            target_version: 0,
        }
    }

    pub fn with_segment(mut self, segment_id: SegmentId, node_id: NodeId, version: i64) -> Self {
        self.segments
            .insert(segment_id, SegmentDist { node_id, version });
        self
    }

    pub fn with_growing(mut self, segment: Segment) -> Self {
        self.growing_segments.insert(segment.id, segment);
        self
    }

    pub fn with_target_version(mut self, version: i64) -> Self {
        self.target_version = version;
        self
    }

    /// True if the leader currently routes `segment_id` to `node_id`
    pub fn serves(&self, segment_id: SegmentId, node_id: NodeId) -> bool {
        self.segments
            .get(&segment_id)
            .map(|dist| dist.node_id == node_id)
            .unwrap_or(false)
    }
}
