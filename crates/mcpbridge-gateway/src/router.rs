//! Router - decides which connected client receives a request
//!
//! Resolution order:
//! 1. an explicit `targetClientId` on the frame, used unconditionally
//! 2. the routing rule for the method
//! 3. the configured default target type
//!
//! For a resolved type the first connected client in arrival order wins.
//! Successful decisions go out on the delivery channel, failures on the error
//! channel; `route` itself never fails.

use std::collections::HashMap;
use std::sync::Arc;

use mcpbridge_core::{
    BridgeConfig, BridgeEvent, ClientType, EventSender, JsonRpcFrame, RequestId, RoutingRule,
    TaskStatus, TaskUpdate,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::DiscoveryRegistry;
use crate::tasks::TaskStore;

/// Bounded capacity of the delivery and error channels
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("no routing rule or default target type for method '{method}'")]
    NoTargetType { method: String },
    #[error("no connected {target_type} client available for method '{method}'")]
    NoConnectedClient {
        method: String,
        target_type: ClientType,
    },
    #[error("frame is not a routable request")]
    NotRoutable,
    #[error("delivery channel closed")]
    ChannelClosed,
}

/// Method → rule table with exact and `prefix*` keys
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    exact: HashMap<String, RoutingRule>,
    /// `(prefix without '*', rule)`, ordered by priority desc, prefix length desc, prefix
    prefixes: Vec<(String, RoutingRule)>,
}

impl RoutingTable {
    pub fn new(rules: &HashMap<String, RoutingRule>) -> Self {
        let mut exact = HashMap::new();
        let mut prefixes = Vec::new();
        for (key, rule) in rules {
            match key.strip_suffix('*') {
                Some(prefix) => prefixes.push((prefix.to_string(), rule.clone())),
                None => {
                    exact.insert(key.clone(), rule.clone());
                }
            }
        }
        prefixes.sort_by(|(a, ra), (b, rb)| {
            rb.priority
                .cmp(&ra.priority)
                .then_with(|| b.len().cmp(&a.len()))
                .then_with(|| a.cmp(b))
        });
        Self { exact, prefixes }
    }

    pub fn rule_for(&self, method: &str) -> Option<&RoutingRule> {
        if let Some(rule) = self.exact.get(method) {
            return Some(rule);
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| method.starts_with(prefix.as_str()))
            .map(|(_, rule)| rule)
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}

/// Target type for `method`: its rule, else `default_type`.
///
/// Pure: the same inputs always give the same answer.
pub fn determine_target_type(
    method: &str,
    table: &RoutingTable,
    default_type: Option<ClientType>,
) -> Option<ClientType> {
    table
        .rule_for(method)
        .map(|rule| rule.target_type)
        .or(default_type)
}

/// A request from `origin_client_id` awaiting a routing decision
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub origin_client_id: String,
    pub frame: JsonRpcFrame,
}

impl OutboundMessage {
    pub fn new(origin_client_id: impl Into<String>, frame: JsonRpcFrame) -> Self {
        Self {
            origin_client_id: origin_client_id.into(),
            frame,
        }
    }
}

/// A routing decision ready for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMessage {
    pub task_id: String,
    pub origin_client_id: String,
    pub target_client_id: String,
    /// The origin's frame with `target_client_id` filled in
    pub frame: JsonRpcFrame,
    /// The origin named the target itself; redelivery keeps it
    pub pinned: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingFailure {
    pub origin_client_id: String,
    pub request_id: Option<RequestId>,
    pub task_id: Option<String>,
    pub error: RoutingError,
}

/// Receiving ends of the router's output channels
pub struct RouterChannels {
    pub deliveries: mpsc::Receiver<RoutedMessage>,
    pub errors: mpsc::Receiver<RoutingFailure>,
}

pub struct Router {
    registry: Arc<DiscoveryRegistry>,
    tasks: Arc<TaskStore>,
    event_tx: EventSender,
    table: RoutingTable,
    default_target_type: Option<ClientType>,
    task_max_attempts: u32,
    delivery_tx: mpsc::Sender<RoutedMessage>,
    error_tx: mpsc::Sender<RoutingFailure>,
}

impl Router {
    pub fn new(
        registry: Arc<DiscoveryRegistry>,
        tasks: Arc<TaskStore>,
        event_tx: EventSender,
        config: &BridgeConfig,
    ) -> (Self, RouterChannels) {
        let (delivery_tx, deliveries) = mpsc::channel(CHANNEL_CAPACITY);
        let (error_tx, errors) = mpsc::channel(CHANNEL_CAPACITY);
        let router = Self {
            registry,
            tasks,
            event_tx,
            table: RoutingTable::new(&config.routing_rules),
            default_target_type: config.default_target_type,
            task_max_attempts: config.task_max_attempts,
            delivery_tx,
            error_tx,
        };
        (router, RouterChannels { deliveries, errors })
    }

    pub fn determine_target_type(&self, method: &str) -> Option<ClientType> {
        determine_target_type(method, &self.table, self.default_target_type)
    }

    /// A request with an explicit target or a resolvable target type
    pub fn can_route(&self, frame: &JsonRpcFrame) -> bool {
        if frame.id.is_none() {
            return false;
        }
        match (&frame.target_client_id, frame.method()) {
            (Some(_), Some(_)) => true,
            (None, Some(method)) => self.determine_target_type(method).is_some(),
            _ => false,
        }
    }

    /// Resolve the receiving client id for `frame`
    pub fn resolve_target(&self, frame: &JsonRpcFrame) -> Result<String, RoutingError> {
        if let Some(target) = &frame.target_client_id {
            return Ok(target.clone());
        }
        let method = frame.method().ok_or(RoutingError::NotRoutable)?;
        let target_type =
            self.determine_target_type(method)
                .ok_or_else(|| RoutingError::NoTargetType {
                    method: method.to_string(),
                })?;

        // First connected candidate in arrival order; load balancing would go here
        self.registry
            .connected_clients_by_type(target_type)
            .into_iter()
            .next()
            .map(|record| record.id)
            .ok_or_else(|| RoutingError::NoConnectedClient {
                method: method.to_string(),
                target_type,
            })
    }

    /// Route a request, creating its task.
    ///
    /// Returns the task id on success; failures are reported on the error channel.
    pub async fn route(&self, message: OutboundMessage) -> Option<String> {
        let OutboundMessage {
            origin_client_id,
            frame,
        } = message;

        let request_id = match &frame.id {
            Some(id) if frame.method.is_some() => id.clone(),
            _ => {
                self.report(RoutingFailure {
                    origin_client_id,
                    request_id: frame.id.clone(),
                    task_id: None,
                    error: RoutingError::NotRoutable,
                });
                return None;
            }
        };

        let target_client_id = match self.resolve_target(&frame) {
            Ok(target) => target,
            Err(error) => {
                self.report(RoutingFailure {
                    origin_client_id,
                    request_id: Some(request_id),
                    task_id: None,
                    error,
                });
                return None;
            }
        };

        let task_id = Uuid::new_v4().to_string();
        self.tasks
            .create_task(&task_id, &origin_client_id, self.task_max_attempts);
        self.tasks.update_task(
            &task_id,
            TaskUpdate {
                method: frame.method.clone(),
                target_client_id: Some(target_client_id.clone()),
                origin_request_id: serde_json::to_value(&request_id).ok(),
                ..Default::default()
            },
        );

        info!(
            task_id = %task_id,
            origin = %origin_client_id,
            target = %target_client_id,
            method = frame.method().unwrap_or_default(),
            "[Router] Routed request"
        );
        self.event_tx.emit(BridgeEvent::TaskCreated {
            task_id: task_id.clone(),
            client_id: origin_client_id.clone(),
            target_client_id: target_client_id.clone(),
        });

        let pinned = frame.target_client_id.is_some();
        let routed = RoutedMessage {
            task_id: task_id.clone(),
            origin_client_id,
            frame: frame.with_target(target_client_id.clone()),
            target_client_id,
            pinned,
        };
        self.deliver(routed).await.then_some(task_id)
    }

    /// Re-resolve and re-emit an open task after a failed delivery.
    ///
    /// Pinned messages keep their target; others pick the current first
    /// connected client of the type. Returns the new target on success.
    pub async fn redeliver(&self, mut message: RoutedMessage) -> Option<String> {
        let task = self.tasks.get_task(&message.task_id)?;
        if task.is_terminal() {
            debug!(task_id = %message.task_id, "[Router] Task finished, not redelivering");
            return None;
        }

        if !message.pinned {
            let mut unpinned = message.frame.clone();
            unpinned.target_client_id = None;
            match self.resolve_target(&unpinned) {
                Ok(target) => {
                    message.target_client_id = target.clone();
                    message.frame.target_client_id = Some(target);
                }
                Err(error) => {
                    self.tasks.update_task(
                        &message.task_id,
                        TaskUpdate::status(TaskStatus::Failed).with_error(error.to_string()),
                    );
                    self.report(RoutingFailure {
                        origin_client_id: message.origin_client_id,
                        request_id: serde_json::from_value(
                            task.origin_request_id.unwrap_or_default(),
                        )
                        .ok(),
                        task_id: Some(message.task_id),
                        error,
                    });
                    return None;
                }
            }
        }

        self.tasks.update_task(
            &message.task_id,
            TaskUpdate::status(TaskStatus::Pending).with_target(message.target_client_id.clone()),
        );
        let target = message.target_client_id.clone();
        self.deliver(message).await.then_some(target)
    }

    async fn deliver(&self, message: RoutedMessage) -> bool {
        let task_id = message.task_id.clone();
        let origin_client_id = message.origin_client_id.clone();
        let request_id = message.frame.id.clone();
        if self.delivery_tx.send(message).await.is_err() {
            self.tasks.update_task(
                &task_id,
                TaskUpdate::status(TaskStatus::Failed).with_error("delivery channel closed"),
            );
            self.report(RoutingFailure {
                origin_client_id,
                request_id,
                task_id: Some(task_id),
                error: RoutingError::ChannelClosed,
            });
            return false;
        }
        true
    }

    fn report(&self, failure: RoutingFailure) {
        warn!(
            origin = %failure.origin_client_id,
            error = %failure.error,
            "[Router] Routing failed"
        );
        if let Err(e) = self.error_tx.try_send(failure) {
            debug!("[Router] Routing error not delivered: {}", e);
        }
    }
}
