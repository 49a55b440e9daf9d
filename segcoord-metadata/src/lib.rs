//! segcoord Metadata
//!
//! The three views of cluster state the segment checker reconciles.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         read-only to checkers                    │
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌───────────────────┐  │
//! │  │ TopologyStore│  │DistributionManager│  │   TargetManager   │  │
//! │  │ collections, │  │ segments/channels │  │  next / current   │  │
//! │  │  replicas    │  │  / leader views   │  │                   │  │
//! │  └──────────────┘  └──────────────────┘  └───────────────────┘  │
//! │         ▲                   ▲                      ▲            │
//! │   load / release     heartbeat ingestion,     Broker (recovery  │
//! │                       task executor            info), promote   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every manager owns its maps behind `parking_lot` locks and is shared as an
//! `Arc`; nothing here is a process-wide singleton.

pub mod broker;
pub mod distribution;
pub mod target;
pub mod topology;

pub use broker::{Broker, BrokerError, RecoveryInfo, StaticBroker};
pub use distribution::{
    ChannelDistManager, DistributionManager, DistributionSnapshot, LeaderViewManager,
    SegmentDistManager,
};
pub use target::{
    CollectionTarget, TargetConfig, TargetError, TargetManager, TargetScope, TargetSnapshot,
};
pub use topology::{CollectionManager, ReplicaManager, TopologyStore};
