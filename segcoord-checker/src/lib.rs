//! segcoord Checker
//!
//! Reconciles where segments *should* be (targets) with where they *are*
//! (distribution) and emits grow/reduce tasks.
//!
//! # Architecture
//!
//! ```text
//!   TargetObserver ──refresh/promote──► TargetManager ◄──┐
//!                                                        │ snapshot
//!   CheckerController ──tick/trigger──► SegmentChecker ──┤
//!          │                                 │           │ snapshot
//!          │ mpsc<Task>                      ▼           │
//!          ▼                             Balance    DistributionManager
//!   LocalExecutor ──────────apply──────────────────────────┘
//! ```

pub mod balance;
pub mod checker;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod executor;
pub mod metrics;
pub mod observer;
pub mod segment_checker;
pub mod task;

pub use balance::{Balance, BalancerKind, RoundRobinBalancer, ScoreBasedBalancer, SegmentAssignPlan};
pub use checker::{Checker, CheckerId};
pub use cluster::{Cluster, ClusterSpec};
pub use config::{CheckerConfig, ConfigError};
pub use controller::CheckerController;
pub use executor::{ExecutionResult, ExecutorError, LocalExecutor};
pub use observer::{ObserveResult, PromotionListener, TargetObserver};
pub use segment_checker::SegmentChecker;
pub use task::{Action, ActionType, DataScope, Task, TaskPriority};
