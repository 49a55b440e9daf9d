//! Segment Checker
//!
//! Compares the target (current ∪ next) with the observed distribution and
//! emits the tasks that close the gap:
//! - Lacking segments: in the target, not on any replica node → Grow
//! - Redundant segments: on a replica node, not in the target → Reduce
//! - Repeated segments: several copies in one replica → Reduce the stale ones
//! - Stale growing segments: sealed elsewhere or behind the seek point → Reduce
//! - Orphans: collection released, or node outside every replica → Reduce
//!
//! One pass reads a single [`DistributionSnapshot`] and one [`TargetSnapshot`]
//! per collection, so every decision in a pass is made against the same state.

use crate::balance::Balance;
use crate::checker::{Checker, CheckerId};
use crate::metrics;
use crate::task::{Action, ActionType, DataScope, Task};
use segcoord_core::{
    CollectionId, NodeId, Replica, Segment, SegmentId, INVALID_ID,
};
use segcoord_metadata::{
    DistributionManager, DistributionSnapshot, TargetManager, TargetScope, TargetSnapshot,
    TopologyStore,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const REASON_LACK: &str = "lacks of segment";
pub const REASON_REDUNDANT: &str = "redundancies of segment";
pub const REASON_REPEATED: &str = "repeated segment";
pub const REASON_STALE_GROWING: &str = "stale growing segment";
pub const REASON_RELEASED: &str = "collection released";
pub const REASON_OUT_OF_REPLICA: &str = "segment outside replica";

pub struct SegmentChecker {
    topology: Arc<TopologyStore>,
    dist: Arc<DistributionManager>,
    targets: Arc<TargetManager>,
    balancer: Arc<dyn Balance>,
}

impl SegmentChecker {
    pub fn new(
        topology: Arc<TopologyStore>,
        dist: Arc<DistributionManager>,
        targets: Arc<TargetManager>,
        balancer: Arc<dyn Balance>,
    ) -> Self {
        Self {
            topology,
            dist,
            targets,
            balancer,
        }
    }

    fn check_replica(
        &self,
        replica: &Replica,
        target: &TargetSnapshot,
        dist: &DistributionSnapshot,
    ) -> Vec<Task> {
        let mut tasks = Vec::new();

        let (lacks, redundancies) = self.diff_segments(replica, target, dist);
        tasks.extend(self.create_load_tasks(replica, lacks));

        let redundancies = self.filter_segment_in_use(replica, target, dist, redundancies);
        tasks.extend(
            redundancies
                .iter()
                .map(|s| Task::reduce(replica.id, s, DataScope::All, REASON_REDUNDANT)),
        );

        let repeated = self.find_repeated_segments(replica, dist);
        let repeated = self.filter_existed_on_leader(replica, dist, repeated);
        tasks.extend(
            repeated
                .iter()
                .map(|s| Task::reduce(replica.id, s, DataScope::All, REASON_REPEATED)),
        );

        let growing = self.find_stale_growing_segments(replica, target, dist);
        tasks.extend(growing.iter().map(|s| {
            Task::reduce(replica.id, s, DataScope::Streaming, REASON_STALE_GROWING)
        }));

        tasks
    }

    /// Target segments missing from the replica, and replica copies the target
    /// no longer names
    fn diff_segments(
        &self,
        replica: &Replica,
        target: &TargetSnapshot,
        dist: &DistributionSnapshot,
    ) -> (Vec<Segment>, Vec<Segment>) {
        let expected = target.expected_segments();
        let placed = sealed_copies(replica, dist);

        // A leader may already route a segment to a replica node before that
        // node's own report catches up.
        let present: HashSet<SegmentId> = placed
            .iter()
            .map(|s| s.id)
            .chain(
                dist.leader_views_by_replica(replica)
                    .into_iter()
                    .flat_map(|view| view.segments.iter())
                    .filter(|(_, d)| replica.contains(d.node_id))
                    .map(|(id, _)| *id),
            )
            .collect();

        let lacks = expected
            .iter()
            .filter(|(id, _)| !present.contains(id))
            .map(|(_, info)| Segment::from_info(info))
            .collect();

        let redundancies = placed
            .into_iter()
            .filter(|s| !expected.contains_key(&s.id))
            .cloned()
            .collect();

        (lacks, redundancies)
    }

    fn create_load_tasks(&self, replica: &Replica, lacks: Vec<Segment>) -> Vec<Task> {
        if lacks.is_empty() {
            return Vec::new();
        }

        let nodes = replica.node_list();
        if nodes.is_empty() {
            warn!(
                replica_id = replica.id,
                lacking = lacks.len(),
                "Replica has no nodes, cannot place segments"
            );
            return Vec::new();
        }

        let wanted: BTreeSet<SegmentId> = lacks.iter().map(|s| s.id).collect();
        let mut planned = BTreeSet::new();
        let mut tasks = Vec::with_capacity(lacks.len());

        for mut plan in self.balancer.assign_segment(&lacks, &nodes) {
            plan.replica_id = replica.id;

            if !replica.contains(plan.to) || !wanted.contains(&plan.segment.id) {
                warn!(
                    replica_id = replica.id,
                    segment_id = plan.segment.id,
                    node_id = plan.to,
                    "Dropping balancer plan outside the replica"
                );
                metrics::record_plan_dropped();
                continue;
            }
            if !planned.insert(plan.segment.id) {
                continue;
            }

            tasks.push(Task::grow(plan.replica_id, &plan.segment, plan.to, REASON_LACK));
        }

        if planned.len() < wanted.len() {
            debug!(
                replica_id = replica.id,
                unplaced = wanted.len() - planned.len(),
                "Balancer left segments unplaced"
            );
        }
        tasks
    }

    /// Keep redundancies whose shard leader has caught up with the current
    /// target; a lagging leader may still route queries to them
    fn filter_segment_in_use(
        &self,
        replica: &Replica,
        target: &TargetSnapshot,
        dist: &DistributionSnapshot,
        segments: Vec<Segment>,
    ) -> Vec<Segment> {
        let current_version = target.version();
        segments
            .into_iter()
            .filter(|s| match dist.shard_leader_view(replica, &s.insert_channel) {
                Some(view) if view.target_version != current_version => {
                    debug!(
                        segment_id = s.id,
                        leader = view.id,
                        leader_version = view.target_version,
                        current_version,
                        "Redundant segment kept, leader not synced"
                    );
                    false
                }
                _ => true,
            })
            .collect()
    }

    /// Every copy in the replica except the newest one per segment id
    ///
    /// Among copies sharing the newest version, the one the shard leader serves
    /// survives, otherwise the one on the lowest node.
    fn find_repeated_segments(
        &self,
        replica: &Replica,
        dist: &DistributionSnapshot,
    ) -> Vec<Segment> {
        let mut copies: BTreeMap<SegmentId, Vec<&Segment>> = BTreeMap::new();
        for segment in sealed_copies(replica, dist) {
            copies.entry(segment.id).or_default().push(segment);
        }

        let mut repeated = Vec::new();
        for (segment_id, mut group) in copies {
            if group.len() < 2 {
                continue;
            }

            let served = dist
                .shard_leader_view(replica, &group[0].insert_channel)
                .and_then(|view| view.segments.get(&segment_id))
                .map(|d| d.node_id);

            group.sort_by_key(|s| {
                (
                    std::cmp::Reverse(s.version),
                    Some(s.node_id) != served,
                    s.node_id,
                )
            });
            repeated.extend(group.into_iter().skip(1).cloned());
        }
        repeated
    }

    /// Drop candidates the shard leader still routes to
    fn filter_existed_on_leader(
        &self,
        replica: &Replica,
        dist: &DistributionSnapshot,
        segments: Vec<Segment>,
    ) -> Vec<Segment> {
        segments
            .into_iter()
            .filter(|s| {
                let in_use = dist
                    .shard_leader_view(replica, &s.insert_channel)
                    .map(|view| view.serves(s.id, s.node_id))
                    .unwrap_or(false);
                if in_use {
                    debug!(
                        segment_id = s.id,
                        node_id = s.node_id,
                        "Repeated copy kept, leader serves it"
                    );
                }
                !in_use
            })
            .collect()
    }

    /// Growing copies already sealed, or wholly behind the channel seek point
    ///
    /// Looks at the growing segments each leader view holds and at growing
    /// copies the replica's nodes report directly.
    fn find_stale_growing_segments(
        &self,
        replica: &Replica,
        target: &TargetSnapshot,
        dist: &DistributionSnapshot,
    ) -> Vec<Segment> {
        let mut stale = Vec::new();

        for view in dist.leader_views_by_replica(replica) {
            for growing in view.growing_segments.values() {
                let sealed = view.segments.contains_key(&growing.id);
                if sealed || behind_seek(growing, &view.channel, target) {
                    let mut segment = growing.clone();
                    if segment.node_id == INVALID_ID {
                        segment.node_id = view.id;
                    }
                    if segment.insert_channel.is_empty() {
                        segment.insert_channel = view.channel.clone();
                    }
                    debug!(
                        segment_id = segment.id,
                        node_id = segment.node_id,
                        sealed,
                        "Stale growing segment"
                    );
                    stale.push(segment);
                }
            }
        }

        for growing in dist
            .segments_by_replica(replica)
            .into_iter()
            .filter(|s| s.is_growing())
        {
            let sealed = dist
                .shard_leader_view(replica, &growing.insert_channel)
                .map(|view| view.segments.contains_key(&growing.id))
                .unwrap_or(false);
            if sealed || behind_seek(growing, &growing.insert_channel, target) {
                debug!(
                    segment_id = growing.id,
                    node_id = growing.node_id,
                    sealed,
                    "Stale growing copy"
                );
                stale.push(growing.clone());
            }
        }
        stale
    }

    /// Copies no replica accounts for
    fn find_orphans(&self, loaded: &[CollectionId], dist: &DistributionSnapshot) -> Vec<Task> {
        let loaded: HashSet<CollectionId> = loaded.iter().copied().collect();

        dist.segments()
            .filter_map(|segment| {
                let scope = if segment.is_growing() {
                    DataScope::Streaming
                } else {
                    DataScope::Historical
                };
                if !loaded.contains(&segment.collection_id) {
                    Some(Task::reduce(INVALID_ID, segment, scope, REASON_RELEASED))
                } else if self
                    .topology
                    .replicas
                    .get_by_collection_and_node(segment.collection_id, segment.node_id)
                    .is_none()
                {
                    Some(Task::reduce(INVALID_ID, segment, scope, REASON_OUT_OF_REPLICA))
                } else {
                    None
                }
            })
            .collect()
    }
}

impl Checker for SegmentChecker {
    fn id(&self) -> CheckerId {
        CheckerId::Segment
    }

    fn description(&self) -> &'static str {
        "segment checker: reconciles sealed and growing segments against the target"
    }

    #[instrument(skip_all, name = "segment_check")]
    fn check(&self, cancel: &CancellationToken) -> Vec<Task> {
        let started = Instant::now();
        let dist = self.dist.snapshot();
        let loaded = self.topology.collections.get_all();

        let mut tasks = Vec::new();
        let mut cancelled = false;

        'collections: for &collection_id in &loaded {
            let target = self.targets.snapshot(collection_id);
            for replica in self.topology.replicas.get_by_collection(collection_id) {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'collections;
                }
                tasks.extend(self.check_replica(&replica, &target, &dist));
            }
        }

        if cancelled || cancel.is_cancelled() {
            warn!(tasks = tasks.len(), "Segment check cancelled");
            metrics::record_check_cancelled(self.id().as_str());
        } else {
            tasks.extend(self.find_orphans(&loaded, &dist));
        }

        let tasks = finalize(tasks);
        for task in &tasks {
            debug!(%task, "Task generated");
            if let Some(action) = task.actions().first() {
                let label = match action.action_type() {
                    ActionType::Grow => "grow",
                    ActionType::Reduce => "reduce",
                };
                metrics::record_task(label, task.reason());
            }
        }

        let elapsed = started.elapsed();
        metrics::record_check(self.id().as_str(), elapsed.as_secs_f64(), tasks.len());
        if !tasks.is_empty() {
            info!(
                tasks = tasks.len(),
                generation = dist.generation(),
                ?elapsed,
                "Segment check complete"
            );
        }
        tasks
    }
}

/// Sealed copies of the replica's collection on the replica's nodes
fn sealed_copies<'a>(replica: &Replica, dist: &'a DistributionSnapshot) -> Vec<&'a Segment> {
    dist.segments_by_replica(replica)
        .into_iter()
        .filter(|s| !s.is_growing())
        .collect()
}

/// At or behind the current-target seek point of `channel`, and not still
/// listed as unflushed there; unknown channels are never stale
fn behind_seek(growing: &Segment, channel: &str, target: &TargetSnapshot) -> bool {
    target
        .get_dm_channel(channel, TargetScope::Current)
        .map(|ch| {
            growing.start_timestamp() <= ch.seek_timestamp() && !ch.is_unflushed(growing.id)
        })
        .unwrap_or(false)
}

/// One task per (action, segment, node, scope), in stable order
fn finalize(mut tasks: Vec<Task>) -> Vec<Task> {
    let mut seen = HashSet::new();
    tasks.retain(|task| match task.actions().first() {
        Some(action) => seen.insert(action_key(action)),
        None => false,
    });
    tasks.sort_by_key(Task::sort_key);
    tasks
}

fn action_key(action: &Action) -> (ActionType, SegmentId, NodeId, DataScope) {
    (
        action.action_type(),
        action.segment_id(),
        action.node_id(),
        action.scope(),
    )
}
