//! Checker abstraction
//!
//! A checker compares desired and observed state and emits [`Task`]s. Checkers
//! never mutate shared state and never execute anything; the controller runs
//! them on a schedule and forwards their output.

use crate::task::Task;
use tokio_util::sync::CancellationToken;

/// Stable checker identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckerId {
    Segment,
}

impl CheckerId {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckerId::Segment => "segment_checker",
        }
    }
}

pub trait Checker: Send + Sync {
    fn id(&self) -> CheckerId;

    fn description(&self) -> &'static str;

    /// One full pass; returns whatever was found before `cancel` fired
    fn check(&self, cancel: &CancellationToken) -> Vec<Task>;
}
