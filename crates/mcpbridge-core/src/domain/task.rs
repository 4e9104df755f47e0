//! Task - bookkeeping for one routed request

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed tasks are never mutated again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One routed request awaiting completion
///
/// Invariant: `attempts >= max_attempts` implies `status == Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    /// Origin client
    pub client_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_client_id: Option<String>,
    /// Request id as the origin sent it; restored on the forwarded response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_request_id: Option<Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, client_id: impl Into<String>, max_attempts: u32) -> Self {
        let now = Utc::now();
        let mut task = Self {
            id: id.into(),
            client_id: client_id.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            error: None,
            method: None,
            target_client_id: None,
            origin_request_id: None,
        };
        if task.is_exhausted() {
            task.status = TaskStatus::Failed;
            task.error = Some("max attempts is zero".to_string());
        }
        task
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Partial update merged by `TaskStore::update_task`
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub error: Option<String>,
    pub method: Option<String>,
    pub target_client_id: Option<String>,
    pub origin_request_id: Option<Value>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_target(mut self, client_id: impl Into<String>) -> Self {
        self.target_client_id = Some(client_id.into());
        self
    }

    /// Merge set fields into `task`
    pub fn apply(self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(error) = self.error {
            task.error = Some(error);
        }
        if let Some(method) = self.method {
            task.method = Some(method);
        }
        if let Some(target) = self.target_client_id {
            task.target_client_id = Some(target);
        }
        if let Some(request_id) = self.origin_request_id {
            task.origin_request_id = Some(request_id);
        }
    }
}
