//! Distribution snapshot manager
//!
//! Observed placement as reported by the worker nodes:
//! - Segment distribution (sealed copies per node)
//! - Channel distribution (which node watches which channel)
//! - Leader views (per channel leader bookkeeping)
//!
//! Each map is locked independently and keyed by node. A node's `update`
//! replaces everything that node reported before, under one write lock, so a
//! reader never sees half of a node's report. [`DistributionManager::snapshot`]
//! takes the three read locks in a fixed order and hands back an owned,
//! point-in-time copy for a whole check pass.

use parking_lot::RwLock;
use segcoord_core::{
    CollectionId, DmChannel, LeaderView, NodeId, Replica, Segment, SegmentId,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

type NodeMap<T> = BTreeMap<NodeId, Arc<Vec<T>>>;

struct Reports<T> {
    by_node: NodeMap<T>,
    generation: u64,
}

/// Per-node, overwrite-on-update storage shared by the three managers
struct NodeReports<T> {
    inner: RwLock<Reports<T>>,
}

impl<T: Clone> NodeReports<T> {
    fn new() -> Self {
        Self {
            inner: RwLock::new(Reports {
                by_node: BTreeMap::new(),
                generation: 0,
            }),
        }
    }

    fn update(&self, node_id: NodeId, items: Vec<T>) {
        let mut reports = self.inner.write();
        reports.generation += 1;
        if items.is_empty() {
            reports.by_node.remove(&node_id);
        } else {
            reports.by_node.insert(node_id, Arc::new(items));
        }
    }

    /// Read-modify-write of one node's report under the write lock
    fn modify<F: FnOnce(&mut Vec<T>)>(&self, node_id: NodeId, f: F) {
        let mut reports = self.inner.write();
        let mut items = reports
            .by_node
            .get(&node_id)
            .map(|items| items.as_ref().clone())
            .unwrap_or_default();
        f(&mut items);
        reports.generation += 1;
        if items.is_empty() {
            reports.by_node.remove(&node_id);
        } else {
            reports.by_node.insert(node_id, Arc::new(items));
        }
    }

    fn on_node(&self, node_id: NodeId) -> Vec<T> {
        self.inner
            .read()
            .by_node
            .get(&node_id)
            .map(|items| items.as_ref().clone())
            .unwrap_or_default()
    }

    fn filter<P: Fn(&T) -> bool>(&self, pred: P) -> Vec<T> {
        self.inner
            .read()
            .by_node
            .values()
            .flat_map(|items| items.iter())
            .filter(|item| pred(*item))
            .cloned()
            .collect()
    }
}

// =============================================================================
// MANAGERS
// =============================================================================

/// Sealed segment copies per node
pub struct SegmentDistManager {
    reports: NodeReports<Segment>,
}

impl Default for SegmentDistManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentDistManager {
    pub fn new() -> Self {
        Self {
            reports: NodeReports::new(),
        }
    }

    /// Replace everything `node_id` holds
    pub fn update(&self, node_id: NodeId, segments: Vec<Segment>) {
        trace!(node_id, count = segments.len(), "Segment distribution updated");
        self.reports.update(node_id, segments);
    }

    pub fn modify<F: FnOnce(&mut Vec<Segment>)>(&self, node_id: NodeId, f: F) {
        self.reports.modify(node_id, f);
    }

    pub fn get_all(&self) -> Vec<Segment> {
        self.reports.filter(|_| true)
    }

    pub fn get_by_node(&self, node_id: NodeId) -> Vec<Segment> {
        self.reports.on_node(node_id)
    }

    /// Every copy of a segment, across nodes
    pub fn get(&self, segment_id: SegmentId) -> Vec<Segment> {
        self.reports.filter(|s| s.id == segment_id)
    }

    pub fn get_by_collection(&self, collection_id: CollectionId) -> Vec<Segment> {
        self.reports.filter(|s| s.collection_id == collection_id)
    }

    pub fn get_by_collection_and_node(
        &self,
        collection_id: CollectionId,
        node_id: NodeId,
    ) -> Vec<Segment> {
        self.get_by_node(node_id)
            .into_iter()
            .filter(|s| s.collection_id == collection_id)
            .collect()
    }
}

/// Channel watches per node
pub struct ChannelDistManager {
    reports: NodeReports<DmChannel>,
}

impl Default for ChannelDistManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelDistManager {
    pub fn new() -> Self {
        Self {
            reports: NodeReports::new(),
        }
    }

    pub fn update(&self, node_id: NodeId, channels: Vec<DmChannel>) {
        trace!(node_id, count = channels.len(), "Channel distribution updated");
        self.reports.update(node_id, channels);
    }

    pub fn get_by_node(&self, node_id: NodeId) -> Vec<DmChannel> {
        self.reports.on_node(node_id)
    }

    pub fn get_all(&self) -> Vec<DmChannel> {
        self.reports.filter(|_| true)
    }

    pub fn get_by_collection(&self, collection_id: CollectionId) -> Vec<DmChannel> {
        self.reports.filter(|c| c.collection_id() == collection_id)
    }

    /// Lowest replica node watching `channel`
    pub fn get_shard_leader(&self, replica: &Replica, channel: &str) -> Option<NodeId> {
        replica.nodes.iter().copied().find(|node| {
            self.get_by_node(*node)
                .iter()
                .any(|c| c.collection_id() == replica.collection_id && c.channel_name() == channel)
        })
    }
}

/// Leader views per leader node
pub struct LeaderViewManager {
    reports: NodeReports<LeaderView>,
}

impl Default for LeaderViewManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderViewManager {
    pub fn new() -> Self {
        Self {
            reports: NodeReports::new(),
        }
    }

    pub fn update(&self, leader_id: NodeId, views: Vec<LeaderView>) {
        trace!(leader_id, count = views.len(), "Leader views updated");
        self.reports.update(leader_id, views);
    }

    pub fn modify<F: FnOnce(&mut Vec<LeaderView>)>(&self, leader_id: NodeId, f: F) {
        self.reports.modify(leader_id, f);
    }

    pub fn get_leader_view(&self, leader_id: NodeId) -> Vec<LeaderView> {
        self.reports.on_node(leader_id)
    }

    pub fn get_leader_shard_view(&self, leader_id: NodeId, channel: &str) -> Option<LeaderView> {
        self.get_leader_view(leader_id)
            .into_iter()
            .find(|v| v.channel == channel)
    }

    pub fn get_by_channel(&self, channel: &str) -> Vec<LeaderView> {
        self.reports.filter(|v| v.channel == channel)
    }
}

/// The three observed-state maps
#[derive(Default)]
pub struct DistributionManager {
    pub segment_dist: SegmentDistManager,
    pub channel_dist: ChannelDistManager,
    pub leader_views: LeaderViewManager,
}

impl DistributionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of all three maps
    pub fn snapshot(&self) -> DistributionSnapshot {
        // Lock order: segments, channels, leader views.
        let segments = self.segment_dist.reports.inner.read();
        let channels = self.channel_dist.reports.inner.read();
        let views = self.leader_views.reports.inner.read();

        DistributionSnapshot {
            generation: segments.generation + channels.generation + views.generation,
            segments: segments.by_node.clone(),
            channels: channels.by_node.clone(),
            leader_views: views.by_node.clone(),
        }
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Owned, immutable view of the distribution at one instant
#[derive(Debug, Clone, Default)]
pub struct DistributionSnapshot {
    segments: NodeMap<Segment>,
    channels: NodeMap<DmChannel>,
    leader_views: NodeMap<LeaderView>,
    generation: u64,
}

impl DistributionSnapshot {
    /// Sum of update counts; grows with every update to any map
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Every sealed copy, ordered by node
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values().flat_map(|s| s.iter())
    }

    pub fn segments_on_node(&self, node_id: NodeId) -> &[Segment] {
        self.segments
            .get(&node_id)
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    /// Copies of the replica's collection held by the replica's nodes
    pub fn segments_by_replica(&self, replica: &Replica) -> Vec<&Segment> {
        replica
            .nodes
            .iter()
            .flat_map(|node| self.segments_on_node(*node))
            .filter(|s| s.collection_id == replica.collection_id)
            .collect()
    }

    pub fn channels_on_node(&self, node_id: NodeId) -> &[DmChannel] {
        self.channels
            .get(&node_id)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    pub fn channels_by_replica(&self, replica: &Replica) -> Vec<&DmChannel> {
        replica
            .nodes
            .iter()
            .flat_map(|node| self.channels_on_node(*node))
            .filter(|c| c.collection_id() == replica.collection_id)
            .collect()
    }

    /// Every leader view, ordered by leader node
    pub fn leader_views(&self) -> impl Iterator<Item = &LeaderView> {
        self.leader_views.values().flat_map(|v| v.iter())
    }

    pub fn leader_views_on_node(&self, node_id: NodeId) -> &[LeaderView] {
        self.leader_views
            .get(&node_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn leader_view(&self, leader_id: NodeId, channel: &str) -> Option<&LeaderView> {
        self.leader_views_on_node(leader_id)
            .iter()
            .find(|v| v.channel == channel)
    }

    /// Leader views for the replica's collection held by the replica's nodes
    pub fn leader_views_by_replica(&self, replica: &Replica) -> Vec<&LeaderView> {
        replica
            .nodes
            .iter()
            .flat_map(|node| self.leader_views_on_node(*node))
            .filter(|v| v.collection_id == replica.collection_id)
            .collect()
    }

    pub fn leader_views_by_channel(&self, channel: &str) -> Vec<&LeaderView> {
        self.leader_views
            .values()
            .flat_map(|v| v.iter())
            .filter(|v| v.channel == channel)
            .collect()
    }

    /// Shard leader of `channel` within a replica
    ///
    /// The lowest replica node watching the channel; failing that, the lowest
    /// replica node reporting a leader view for it.
    pub fn shard_leader(&self, replica: &Replica, channel: &str) -> Option<NodeId> {
        let watching = replica.nodes.iter().copied().find(|node| {
            self.channels_on_node(*node)
                .iter()
                .any(|c| c.collection_id() == replica.collection_id && c.channel_name() == channel)
        });

        watching.or_else(|| {
            replica.nodes.iter().copied().find(|node| {
                self.leader_views_on_node(*node)
                    .iter()
                    .any(|v| v.collection_id == replica.collection_id && v.channel == channel)
            })
        })
    }

    /// Leader view of `channel` within a replica
    pub fn shard_leader_view(&self, replica: &Replica, channel: &str) -> Option<&LeaderView> {
        self.shard_leader(replica, channel)
            .and_then(|leader| self.leader_view(leader, channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segcoord_core::VchannelInfo;

    fn channel(collection: CollectionId, node: NodeId, name: &str) -> DmChannel {
        DmChannel::new(VchannelInfo::new(collection, name), node, 1)
    }

    #[test]
    fn test_update_overwrites_node_report() {
        let manager = SegmentDistManager::new();
        manager.update(
            1,
            vec![
                Segment::new(1, 1, 1, 1, 1, "ch"),
                Segment::new(2, 1, 1, 1, 1, "ch"),
            ],
        );
        manager.update(1, vec![Segment::new(3, 1, 1, 1, 1, "ch")]);

        let ids: Vec<_> = manager.get_by_node(1).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn test_empty_update_clears_node() {
        let manager = SegmentDistManager::new();
        manager.update(1, vec![Segment::new(1, 1, 1, 1, 1, "ch")]);
        manager.update(1, vec![]);
        assert!(manager.get_all().is_empty());
    }

    #[test]
    fn test_get_copies_across_nodes() {
        let manager = SegmentDistManager::new();
        manager.update(1, vec![Segment::new(1, 1, 1, 1, 1, "ch")]);
        manager.update(2, vec![Segment::new(1, 1, 1, 2, 2, "ch")]);
        manager.update(3, vec![Segment::new(9, 2, 1, 3, 1, "ch")]);

        assert_eq!(manager.get(1).len(), 2);
        assert_eq!(manager.get_by_collection(2).len(), 1);
        assert_eq!(manager.get_by_collection_and_node(1, 2).len(), 1);
    }

    #[test]
    fn test_modify_is_read_modify_write() {
        let manager = SegmentDistManager::new();
        manager.update(1, vec![Segment::new(1, 1, 1, 1, 1, "ch")]);
        manager.modify(1, |segments| segments.push(Segment::new(2, 1, 1, 1, 1, "ch")));
        manager.modify(1, |segments| segments.retain(|s| s.id != 1));

        let ids: Vec<_> = manager.get_by_node(1).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_shard_leader_prefers_lowest_watching_node() {
        let manager = ChannelDistManager::new();
        manager.update(3, vec![channel(1, 3, "ch-0")]);
        manager.update(2, vec![channel(1, 2, "ch-0")]);

        let replica = Replica::new(1, 1, [1, 2, 3]);
        assert_eq!(manager.get_shard_leader(&replica, "ch-0"), Some(2));
        assert_eq!(manager.get_shard_leader(&replica, "ch-1"), None);

        let other = Replica::new(2, 2, [2, 3]);
        assert_eq!(manager.get_shard_leader(&other, "ch-0"), None);
    }

    #[test]
    fn test_leader_view_lookup() {
        let manager = LeaderViewManager::new();
        manager.update(
            2,
            vec![
                LeaderView::new(2, 1, "ch-0").with_segment(1, 2, 1),
                LeaderView::new(2, 1, "ch-1"),
            ],
        );

        assert_eq!(manager.get_leader_view(2).len(), 2);
        assert!(manager.get_leader_shard_view(2, "ch-0").unwrap().serves(1, 2));
        assert!(manager.get_leader_shard_view(2, "ch-9").is_none());
        assert_eq!(manager.get_by_channel("ch-1").len(), 1);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_updates() {
        let dist = DistributionManager::new();
        dist.segment_dist
            .update(1, vec![Segment::new(1, 1, 1, 1, 1, "ch")]);
        let snapshot = dist.snapshot();

        dist.segment_dist.update(1, vec![]);
        dist.segment_dist
            .update(2, vec![Segment::new(5, 1, 1, 2, 1, "ch")]);

        let ids: Vec<_> = snapshot.segments().map(|s| s.id).collect();
        assert_eq!(ids, vec![1]);
        assert!(dist.snapshot().generation() > snapshot.generation());
    }

    #[test]
    fn test_snapshot_replica_queries() {
        let dist = DistributionManager::new();
        dist.segment_dist.update(
            1,
            vec![
                Segment::new(1, 1, 1, 1, 1, "ch-0"),
                Segment::new(7, 2, 1, 1, 1, "ch-9"),
            ],
        );
        dist.segment_dist
            .update(4, vec![Segment::new(2, 1, 1, 4, 1, "ch-0")]);
        dist.leader_views
            .update(2, vec![LeaderView::new(2, 1, "ch-0")]);

        let snapshot = dist.snapshot();
        let replica = Replica::new(1, 1, [1, 2]);

        let ids: Vec<_> = snapshot
            .segments_by_replica(&replica)
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![1]);

        // no channel watch reported, the leader view decides
        assert_eq!(snapshot.shard_leader(&replica, "ch-0"), Some(2));
        assert!(snapshot.shard_leader_view(&replica, "ch-0").is_some());
        assert_eq!(snapshot.leader_views_by_replica(&replica).len(), 1);
    }
}
