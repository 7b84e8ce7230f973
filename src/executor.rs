//! Execution of a single due instant on its own tokio task.
//!
//! The core hands over everything the run needs (task closure, hooks,
//! elector) so the core itself never awaits job code. The result flows back
//! as a [`Completion`] message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::elect::Elector;
use crate::job::{Hooks, Task};

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Succeeded,
    Failed(String),
    /// The elector declined this instance, or the election itself failed.
    /// Does not count as a run.
    Skipped,
}

/// Reported by the execution task when it finishes.
#[derive(Debug)]
pub(crate) struct Completion {
    pub id: Uuid,
    pub fired_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Everything an execution task needs, detached from registry state.
pub(crate) struct Execution {
    pub id: Uuid,
    pub name: String,
    pub fired_at: DateTime<Utc>,
    pub task: Task,
    pub hooks: Hooks,
    pub elector: Arc<dyn Elector>,
}

impl Execution {
    /// Spawn the run. The completion message is sent even when the run is
    /// skipped, so the core can release limiter slots and replay queues.
    pub(crate) fn spawn(self, done: mpsc::Sender<Completion>) {
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = self.run().await;
            let completion = Completion {
                id: self.id,
                fired_at: self.fired_at,
                outcome,
                elapsed: started.elapsed(),
            };
            // Core gone: nothing left to account the run against.
            let _ = done.send(completion).await;
        });
    }

    async fn run(&self) -> Outcome {
        match self.elector.elect(self.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id = %self.id, name = %self.name, "Not elected; skipping run");
                return Outcome::Skipped;
            }
            Err(err) => {
                tracing::warn!(job_id = %self.id, name = %self.name, error = %err, "Election failed; skipping run");
                if let Some(hook) = &self.hooks.after_error {
                    hook(self.id, &self.name, &err);
                }
                return Outcome::Skipped;
            }
        }

        if let Some(hook) = &self.hooks.before {
            hook(self.id, &self.name);
        }

        match self.task.call().await {
            Ok(()) => {
                tracing::debug!(job_id = %self.id, name = %self.name, "Job run succeeded");
                if let Some(hook) = &self.hooks.after {
                    hook(self.id, &self.name);
                }
                Outcome::Succeeded
            }
            Err(err) => {
                tracing::warn!(job_id = %self.id, name = %self.name, error = %err, "Job run failed");
                if let Some(hook) = &self.hooks.after_error {
                    hook(self.id, &self.name, &err);
                }
                Outcome::Failed(err.to_string())
            }
        }
    }
}
