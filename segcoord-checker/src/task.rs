//! Task and action model
//!
//! A [`Task`] is an immutable unit of corrective work handed to an executor:
//! the replica it belongs to (or [`INVALID_ID`] when no owning replica is
//! known), an ordered list of [`Action`]s, a priority and a reason. Tasks hold
//! no reference back to the checker that produced them.

use segcoord_core::{CollectionId, NodeId, ReplicaId, Segment, SegmentId, INVALID_ID};
use serde::Serialize;
use std::fmt;

/// Task priority; raising it is the scheduler's business, not the checker's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Which copies a reduce action releases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataScope {
    /// Sealed and growing copies
    All,
    /// Sealed copies only
    Historical,
    /// Growing copies held by a shard leader
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Grow,
    Reduce,
}

/// Load or release one segment on one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Grow {
        segment_id: SegmentId,
        node_id: NodeId,
        channel: String,
    },
    Reduce {
        segment_id: SegmentId,
        node_id: NodeId,
        channel: String,
        scope: DataScope,
    },
}

impl Action {
    pub fn grow(segment: &Segment, node_id: NodeId) -> Self {
        Action::Grow {
            segment_id: segment.id,
            node_id,
            channel: segment.insert_channel.clone(),
        }
    }

    pub fn reduce(segment: &Segment, scope: DataScope) -> Self {
        Action::Reduce {
            segment_id: segment.id,
            node_id: segment.node_id,
            channel: segment.insert_channel.clone(),
            scope,
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Action::Grow { .. } => ActionType::Grow,
            Action::Reduce { .. } => ActionType::Reduce,
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        match self {
            Action::Grow { segment_id, .. } | Action::Reduce { segment_id, .. } => *segment_id,
        }
    }

    pub fn node_id(&self) -> NodeId {
        match self {
            Action::Grow { node_id, .. } | Action::Reduce { node_id, .. } => *node_id,
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            Action::Grow { channel, .. } | Action::Reduce { channel, .. } => channel,
        }
    }

    /// Grow actions always concern sealed data
    pub fn scope(&self) -> DataScope {
        match self {
            Action::Grow { .. } => DataScope::Historical,
            Action::Reduce { scope, .. } => *scope,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Grow {
                segment_id,
                node_id,
                ..
            } => write!(f, "grow segment {} on node {}", segment_id, node_id),
            Action::Reduce {
                segment_id,
                node_id,
                scope,
                ..
            } => write!(
                f,
                "reduce segment {} on node {} ({:?})",
                segment_id, node_id, scope
            ),
        }
    }
}

/// Corrective work for one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    collection_id: CollectionId,
    replica_id: ReplicaId,
    actions: Vec<Action>,
    priority: TaskPriority,
    reason: String,
}

impl Task {
    pub fn new(
        collection_id: CollectionId,
        replica_id: ReplicaId,
        actions: Vec<Action>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            collection_id,
            replica_id,
            actions,
            priority: TaskPriority::Normal,
            reason: reason.into(),
        }
    }

    /// Load `segment` onto `node_id`
    pub fn grow(
        replica_id: ReplicaId,
        segment: &Segment,
        node_id: NodeId,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            segment.collection_id,
            replica_id,
            vec![Action::grow(segment, node_id)],
            reason,
        )
    }

    /// Release `segment` from the node it sits on
    pub fn reduce(
        replica_id: ReplicaId,
        segment: &Segment,
        scope: DataScope,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            segment.collection_id,
            replica_id,
            vec![Action::reduce(segment, scope)],
            reason,
        )
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// True when no owning replica is known
    pub fn is_orphan(&self) -> bool {
        self.replica_id == INVALID_ID
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Ordering key: segment, node, grow before reduce, replica
    pub fn sort_key(&self) -> (SegmentId, NodeId, ActionType, ReplicaId) {
        match self.actions.first() {
            Some(action) => (
                action.segment_id(),
                action.node_id(),
                action.action_type(),
                self.replica_id,
            ),
            None => (SegmentId::MAX, NodeId::MAX, ActionType::Reduce, self.replica_id),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task[collection={} replica={} priority={:?} reason={:?}]",
            self.collection_id, self.replica_id, self.priority, self.reason
        )?;
        for action in &self.actions {
            write!(f, " {}", action)?;
        }
        Ok(())
    }
}
