//! segcoord Core Library
//!
//! Shared vocabulary of the segment placement reconciler:
//! - Identifier aliases and the `-1` "unknown" sentinel
//! - Collections, replicas, segments, channels and leader views
//! - The workspace error type

pub mod error;
pub mod models;

pub use error::{Result, SegcoordError};
pub use models::{
    Collection, CollectionStatus, DmChannel, LeaderView, MsgPosition, Replica, Segment,
    SegmentDist, SegmentInfo, SegmentState, VchannelInfo,
};

/// Every entity in the cluster is identified by a signed 64-bit id
pub type UniqueId = i64;
pub type NodeId = UniqueId;
pub type CollectionId = UniqueId;
pub type PartitionId = UniqueId;
pub type SegmentId = UniqueId;
pub type ReplicaId = UniqueId;

/// Logical timestamp on a write channel
pub type Timestamp = u64;

/// Sentinel for "no such entity" (no source node, no owning replica)
pub const INVALID_ID: UniqueId = -1;
