//! Segment placement
//!
//! The checker decides *what* is missing; a [`Balance`] implementation decides
//! *where* it goes. Two strategies:
//! - [`RoundRobinBalancer`]: spreads segments over nodes in order
//! - [`ScoreBasedBalancer`]: fills the least-loaded node first, counting rows
//!   already placed plus rows assigned earlier in the same call

use segcoord_core::{NodeId, ReplicaId, Segment, INVALID_ID};
use segcoord_metadata::DistributionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Placement of one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentAssignPlan {
    pub segment: Segment,
    /// Node the segment currently sits on, [`INVALID_ID`] for a fresh load
    pub from: NodeId,
    pub to: NodeId,
    /// Left unset by balancers; the caller stamps it
    pub replica_id: ReplicaId,
}

impl SegmentAssignPlan {
    pub fn new(segment: Segment, to: NodeId) -> Self {
        Self {
            segment,
            from: INVALID_ID,
            to,
            replica_id: INVALID_ID,
        }
    }
}

/// Placement strategy
///
/// Implementations must only return plans whose `to` is one of `nodes`; the
/// checker drops anything else.
pub trait Balance: Send + Sync {
    fn assign_segment(&self, segments: &[Segment], nodes: &[NodeId]) -> Vec<SegmentAssignPlan>;
}

/// Segment `i` goes to `nodes[i % nodes.len()]`
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinBalancer;

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl Balance for RoundRobinBalancer {
    fn assign_segment(&self, segments: &[Segment], nodes: &[NodeId]) -> Vec<SegmentAssignPlan> {
        if nodes.is_empty() {
            return Vec::new();
        }

        segments
            .iter()
            .zip(nodes.iter().cycle())
            .map(|(segment, node)| SegmentAssignPlan::new(segment.clone(), *node))
            .collect()
    }
}

/// Least-loaded-first placement by row count
pub struct ScoreBasedBalancer {
    dist: Arc<DistributionManager>,
}

impl ScoreBasedBalancer {
    pub fn new(dist: Arc<DistributionManager>) -> Self {
        Self { dist }
    }

    fn node_rows(&self, nodes: &[NodeId]) -> HashMap<NodeId, i64> {
        let snapshot = self.dist.snapshot();
        nodes
            .iter()
            .map(|node| {
                let rows = snapshot
                    .segments_on_node(*node)
                    .iter()
                    .map(|s| s.num_of_rows.max(0))
                    .sum();
                (*node, rows)
            })
            .collect()
    }
}

impl Balance for ScoreBasedBalancer {
    #[instrument(skip_all, fields(segments = segments.len(), nodes = nodes.len()))]
    fn assign_segment(&self, segments: &[Segment], nodes: &[NodeId]) -> Vec<SegmentAssignPlan> {
        if nodes.is_empty() || segments.is_empty() {
            return Vec::new();
        }

        // Rows already placed plus rows handed out in this call
        let mut pending_load = self.node_rows(nodes);

        // Largest first, so big segments spread before small ones fill gaps
        let mut ordered: Vec<&Segment> = segments.iter().collect();
        ordered.sort_by(|a, b| b.num_of_rows.cmp(&a.num_of_rows).then(a.id.cmp(&b.id)));

        let mut plans = Vec::with_capacity(ordered.len());
        for segment in ordered {
            let Some(target) = nodes
                .iter()
                .copied()
                .min_by_key(|node| (pending_load.get(node).copied().unwrap_or(0), *node))
            else {
                break;
            };

            *pending_load.entry(target).or_default() += segment.num_of_rows.max(1);
            debug!(segment_id = segment.id, node_id = target, "Segment assigned");
            plans.push(SegmentAssignPlan::new(segment.clone(), target));
        }
        plans
    }
}

/// Configurable balancer choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    RoundRobin,
    #[default]
    ScoreBased,
}

impl BalancerKind {
    pub fn build(self, dist: Arc<DistributionManager>) -> Arc<dyn Balance> {
        match self {
            BalancerKind::RoundRobin => Arc::new(RoundRobinBalancer::new()),
            BalancerKind::ScoreBased => Arc::new(ScoreBasedBalancer::new(dist)),
        }
    }
}

impl fmt::Display for BalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerKind::RoundRobin => write!(f, "round_robin"),
            BalancerKind::ScoreBased => write!(f, "score_based"),
        }
    }
}

impl FromStr for BalancerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" => Ok(BalancerKind::RoundRobin),
            "score_based" | "score-based" => Ok(BalancerKind::ScoreBased),
            other => Err(format!("unknown balancer: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: i64, rows: i64) -> Segment {
        let mut segment = Segment::new(id, 1, 1, INVALID_ID, 0, "ch-0");
        segment.num_of_rows = rows;
        segment
    }

    #[test]
    fn test_round_robin_cycles_nodes() {
        let segments = vec![segment(1, 0), segment(2, 0), segment(3, 0)];
        let plans = RoundRobinBalancer.assign_segment(&segments, &[1, 2]);

        let placed: Vec<_> = plans.iter().map(|p| (p.segment.id, p.to)).collect();
        assert_eq!(placed, vec![(1, 1), (2, 2), (3, 1)]);
        assert!(plans.iter().all(|p| p.replica_id == INVALID_ID));
    }

    #[test]
    fn test_no_nodes_no_plans() {
        assert!(RoundRobinBalancer
            .assign_segment(&[segment(1, 0)], &[])
            .is_empty());

        let dist = Arc::new(DistributionManager::new());
        assert!(ScoreBasedBalancer::new(dist)
            .assign_segment(&[segment(1, 0)], &[])
            .is_empty());
    }

    #[test]
    fn test_score_based_prefers_empty_node() {
        let dist = Arc::new(DistributionManager::new());
        let mut loaded = Segment::new(10, 1, 1, 1, 1, "ch-0");
        loaded.num_of_rows = 1_000;
        dist.segment_dist.update(1, vec![loaded]);

        let balancer = ScoreBasedBalancer::new(dist);
        let plans = balancer.assign_segment(&[segment(1, 100)], &[1, 2]);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].to, 2);
    }

    #[test]
    fn test_score_based_counts_pending_load() {
        let dist = Arc::new(DistributionManager::new());
        let balancer = ScoreBasedBalancer::new(dist);

        let segments = vec![segment(1, 500), segment(2, 300), segment(3, 200)];
        let plans = balancer.assign_segment(&segments, &[1, 2]);

        let placed: HashMap<_, _> = plans.iter().map(|p| (p.segment.id, p.to)).collect();
        assert_eq!(placed[&1], 1);
        assert_eq!(placed[&2], 2);
        assert_eq!(placed[&3], 2);
    }

    #[test]
    fn test_balancer_kind_parse() {
        assert_eq!("round_robin".parse::<BalancerKind>(), Ok(BalancerKind::RoundRobin));
        assert_eq!("Score-Based".parse::<BalancerKind>(), Ok(BalancerKind::ScoreBased));
        assert!("random".parse::<BalancerKind>().is_err());
        assert_eq!(BalancerKind::default().to_string(), "score_based");
    }
}
