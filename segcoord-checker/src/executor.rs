//! Local task executor
//!
//! Applies tasks straight to an in-process [`DistributionManager`], standing
//! in for the worker nodes:
//! - Grow: the node reports a fresh copy, and the replica's shard leader
//!   starts routing the segment to it
//! - Reduce (Historical/All): the copy disappears and leaders stop routing
//!   to it
//! - Reduce (Streaming/All): the growing copy leaves the node's report and
//!   its leader views

use crate::observer::PromotionListener;
use crate::task::{Action, DataScope, Task};
use segcoord_core::{
    CollectionId, NodeId, Segment, SegmentDist, SegmentId,
};
use segcoord_metadata::{DistributionManager, TargetManager, TargetScope, TopologyStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Executor errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Segment {segment_id} is not in any target of collection {collection_id}")]
    SegmentNotInTarget {
        collection_id: CollectionId,
        segment_id: SegmentId,
    },
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Overall execution result
#[derive(Debug, Default)]
pub struct ExecutionResult {
    /// Actions applied
    pub succeeded: usize,
    /// Tasks that failed, with the first error
    pub failed: Vec<(Task, ExecutorError)>,
    /// Total execution time
    pub duration: Duration,
}

impl ExecutionResult {
    /// Summary string
    pub fn summary(&self) -> String {
        format!(
            "{} actions applied, {} tasks failed in {:?}",
            self.succeeded,
            self.failed.len(),
            self.duration
        )
    }
}

pub struct LocalExecutor {
    topology: Arc<TopologyStore>,
    dist: Arc<DistributionManager>,
    targets: Arc<TargetManager>,
}

impl LocalExecutor {
    pub fn new(
        topology: Arc<TopologyStore>,
        dist: Arc<DistributionManager>,
        targets: Arc<TargetManager>,
    ) -> Self {
        Self {
            topology,
            dist,
            targets,
        }
    }

    /// Apply every task, continuing past failures
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub fn apply_all(&self, tasks: &[Task]) -> ExecutionResult {
        let start = Instant::now();
        let mut result = ExecutionResult::default();

        for task in tasks {
            match self.apply(task) {
                Ok(applied) => result.succeeded += applied,
                Err(e) => {
                    warn!(%task, error = %e, "Task failed");
                    crate::metrics::record_task_failed("apply");
                    result.failed.push((task.clone(), e));
                }
            }
        }

        result.duration = start.elapsed();
        info!(summary = %result.summary(), "Tasks applied");
        result
    }

    /// Apply one task's actions in order; returns the number applied
    pub fn apply(&self, task: &Task) -> Result<usize> {
        for action in task.actions() {
            match action {
                Action::Grow {
                    segment_id,
                    node_id,
                    channel,
                } => self.grow(task, *segment_id, *node_id, channel)?,
                Action::Reduce {
                    segment_id,
                    node_id,
                    channel,
                    scope,
                } => self.reduce(*segment_id, *node_id, channel, *scope),
            }
        }
        Ok(task.actions().len())
    }

    fn grow(&self, task: &Task, segment_id: SegmentId, node_id: NodeId, channel: &str) -> Result<()> {
        let collection_id = task.collection_id();
        let target = self.targets.snapshot(collection_id);
        let info = target
            .segments(TargetScope::Current)
            .get(&segment_id)
            .or_else(|| target.segments(TargetScope::Next).get(&segment_id))
            .ok_or(ExecutorError::SegmentNotInTarget {
                collection_id,
                segment_id,
            })?;

        // Newer than every copy already out there
        let version = self
            .dist
            .segment_dist
            .get(segment_id)
            .iter()
            .map(|s| s.version)
            .max()
            .unwrap_or(0)
            + 1;

        let mut segment = Segment::from_info(info);
        segment.node_id = node_id;
        segment.version = version;

        self.dist.segment_dist.modify(node_id, |segments| {
            segments.retain(|s| !(s.id == segment_id && s.collection_id == collection_id));
            segments.push(segment);
        });

        let leader = self
            .topology
            .replicas
            .get(task.replica_id())
            .and_then(|replica| self.dist.snapshot().shard_leader(&replica, channel));
        if let Some(leader) = leader {
            self.dist.leader_views.modify(leader, |views| {
                for view in views
                    .iter_mut()
                    .filter(|v| v.collection_id == collection_id && v.channel == channel)
                {
                    view.segments
                        .insert(segment_id, SegmentDist { node_id, version });
                }
            });
        }

        debug!(segment_id, node_id, version, "Segment loaded");
        Ok(())
    }

    fn reduce(&self, segment_id: SegmentId, node_id: NodeId, channel: &str, scope: DataScope) {
        if matches!(scope, DataScope::All | DataScope::Historical) {
            self.dist.segment_dist.modify(node_id, |segments| {
                segments.retain(|s| s.id != segment_id || s.is_growing())
            });

            let leaders: Vec<NodeId> = self
                .dist
                .leader_views
                .get_by_channel(channel)
                .iter()
                .filter(|v| v.serves(segment_id, node_id))
                .map(|v| v.id)
                .collect();
            for leader in leaders {
                self.dist.leader_views.modify(leader, |views| {
                    for view in views.iter_mut().filter(|v| v.channel == channel) {
                        if view.serves(segment_id, node_id) {
                            view.segments.remove(&segment_id);
                        }
                    }
                });
            }
        }

        if matches!(scope, DataScope::All | DataScope::Streaming) {
            self.dist.segment_dist.modify(node_id, |segments| {
                segments.retain(|s| s.id != segment_id || !s.is_growing())
            });
            self.dist.leader_views.modify(node_id, |views| {
                for view in views.iter_mut() {
                    view.growing_segments.remove(&segment_id);
                }
            });
        }

        debug!(segment_id, node_id, ?scope, "Segment released");
    }

    /// Leaders of `collection_id` adopt a newly promoted target version
    pub fn sync_target_version(&self, collection_id: CollectionId, version: i64) {
        let leaders: BTreeSet<NodeId> = self
            .dist
            .snapshot()
            .leader_views()
            .filter(|v| v.collection_id == collection_id)
            .map(|v| v.id)
            .collect();

        for leader in leaders {
            self.dist.leader_views.modify(leader, |views| {
                for view in views
                    .iter_mut()
                    .filter(|v| v.collection_id == collection_id)
                {
                    view.target_version = version;
                }
            });
        }
        debug!(collection_id, version, "Leader target version synced");
    }
}

impl PromotionListener for LocalExecutor {
    fn on_promoted(&self, collection_id: CollectionId, version: i64) {
        self.sync_target_version(collection_id, version);
    }
}
