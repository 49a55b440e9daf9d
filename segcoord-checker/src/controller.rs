//! Checker controller
//!
//! Runs every registered [`Checker`] on a fixed interval, or right away when
//! [`CheckerController::trigger`] is called, and forwards the produced tasks
//! over a bounded channel to whoever executes them.

use crate::checker::Checker;
use crate::task::Task;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct CheckerController {
    checkers: Vec<Arc<dyn Checker>>,
    interval: Duration,
    trigger: Notify,
    tasks: mpsc::Sender<Task>,
}

impl CheckerController {
    pub fn new(interval: Duration, tasks: mpsc::Sender<Task>) -> Self {
        Self {
            checkers: Vec::new(),
            interval,
            trigger: Notify::new(),
            tasks,
        }
    }

    pub fn with_checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.checkers.push(checker);
        self
    }

    /// Run a pass as soon as possible instead of waiting for the next tick
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Check on every tick or trigger until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            checkers = self.checkers.len(),
            interval = ?self.interval,
            "Checker controller started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.trigger.notified() => debug!("Check triggered"),
                _ = ticker.tick() => {}
            }

            if self.check_once(&cancel).await.is_none() {
                break;
            }
        }

        info!("Checker controller stopped");
    }

    /// Run every checker once and forward its tasks
    ///
    /// Returns the number of tasks sent, or `None` once the receiver is gone
    /// or `cancel` fired mid-send.
    pub async fn check_once(&self, cancel: &CancellationToken) -> Option<usize> {
        let mut dispatched = 0;

        for checker in &self.checkers {
            let tasks = checker.check(cancel);
            if !tasks.is_empty() {
                debug!(
                    checker = checker.id().as_str(),
                    tasks = tasks.len(),
                    "Dispatching tasks"
                );
            }

            for task in tasks {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    sent = self.tasks.send(task) => {
                        if sent.is_err() {
                            warn!("Task receiver dropped, stopping dispatch");
                            return None;
                        }
                        dispatched += 1;
                    }
                }
            }
        }

        Some(dispatched)
    }
}
