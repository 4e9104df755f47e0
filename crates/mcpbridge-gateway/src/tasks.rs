//! Task Store - bookkeeping for routed requests
//!
//! Decoupled from connection state: a client dropping mid-request does not
//! touch the task table. Tasks in a terminal status are never mutated again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mcpbridge_core::{Task, TaskStatus, TaskUpdate};
use tracing::{debug, info, warn};

use crate::registry::{older_than, DiscoveryRegistry};

/// Outcome of one cleanup sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub tasks_removed: usize,
    pub clients_removed: usize,
}

pub struct TaskStore {
    tasks: DashMap<String, Task>,
    expiration: Duration,
}

impl TaskStore {
    pub fn new(expiration: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            expiration,
        }
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Create a `pending` task with zero attempts, replacing any task with the same id
    pub fn create_task(&self, id: &str, client_id: &str, max_attempts: u32) -> Task {
        let task = Task::new(id, client_id, max_attempts);
        if self.tasks.insert(id.to_string(), task.clone()).is_some() {
            warn!(task_id = %id, "[TaskStore] Replaced existing task with the same id");
        }
        debug!(
            task_id = %id,
            client_id = %client_id,
            max_attempts,
            "[TaskStore] Task created"
        );
        task
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks.get(id).map(|task| task.clone())
    }

    /// Merge `update` and refresh `updated_at`.
    ///
    /// `None` for an unknown id. Terminal tasks are returned unchanged.
    pub fn update_task(&self, id: &str, update: TaskUpdate) -> Option<Task> {
        let mut task = self.tasks.get_mut(id)?;
        if task.is_terminal() {
            debug!(
                task_id = %id,
                status = task.status.as_str(),
                "[TaskStore] Ignoring update to finished task"
            );
            return Some(task.clone());
        }

        update.apply(&mut task);
        if task.is_exhausted() && task.status != TaskStatus::Completed {
            task.status = TaskStatus::Failed;
        }
        task.updated_at = Utc::now();
        Some(task.clone())
    }

    /// `attempts += 1`; `failed` once `attempts >= max_attempts`, otherwise `pending`
    pub fn increment_task_attempts(&self, id: &str) -> Option<Task> {
        let mut task = self.tasks.get_mut(id)?;
        if task.is_terminal() {
            return Some(task.clone());
        }

        task.attempts += 1;
        task.updated_at = Utc::now();
        if task.is_exhausted() {
            task.status = TaskStatus::Failed;
            if task.error.is_none() {
                task.error = Some(format!("failed after {} attempts", task.attempts));
            }
            warn!(
                task_id = %id,
                attempts = task.attempts,
                "[TaskStore] Task exhausted its attempts"
            );
        } else {
            task.status = TaskStatus::Pending;
        }
        Some(task.clone())
    }

    /// Open tasks currently assigned to `target_client_id`
    pub fn active_tasks_for_target(&self, target_client_id: &str) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|entry| {
                !entry.is_terminal()
                    && entry.target_client_id.as_deref() == Some(target_client_id)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// One sweep: expired tasks and stale disconnected clients share the threshold
    pub fn cleanup(&self, registry: &DiscoveryRegistry) -> CleanupReport {
        self.cleanup_at(Utc::now(), registry)
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>, registry: &DiscoveryRegistry) -> CleanupReport {
        let before = self.tasks.len();
        self.tasks
            .retain(|_, task| !older_than(now, task.updated_at, self.expiration));
        let tasks_removed = before.saturating_sub(self.tasks.len());

        let clients_removed = registry.purge_disconnected(now, self.expiration).len();

        let report = CleanupReport {
            tasks_removed,
            clients_removed,
        };
        if report != CleanupReport::default() {
            info!(
                tasks_removed,
                clients_removed, "[TaskStore] Cleanup sweep removed expired entries"
            );
        }
        report
    }
}
