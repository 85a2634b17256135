// Node status change event handling
// Provides event-driven notifications when a member changes lifecycle status

use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use strand_api::model::NodeStatus;
use strand_common::NodeId;

/// Type of status change event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusChangeType {
    /// A new member was registered
    MemberJoin,
    /// A member was removed from the registry
    MemberLeave,
    /// A member's status changed (e.g. READY -> AWAY_SOON)
    StatusChange,
}

impl std::fmt::Display for StatusChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusChangeType::MemberJoin => write!(f, "MEMBER_JOIN"),
            StatusChangeType::MemberLeave => write!(f, "MEMBER_LEAVE"),
            StatusChangeType::StatusChange => write!(f, "STATUS_CHANGE"),
        }
    }
}

/// Status change event
#[derive(Clone, Debug)]
pub struct StatusChangeEvent {
    pub change_type: StatusChangeType,
    pub node_id: NodeId,
    /// Whether the event concerns this process
    pub is_self: bool,
    pub previous: Option<NodeStatus>,
    pub current: NodeStatus,
    pub timestamp: i64,
}

impl StatusChangeEvent {
    pub fn member_join(node_id: NodeId, is_self: bool, status: NodeStatus) -> Self {
        Self {
            change_type: StatusChangeType::MemberJoin,
            node_id,
            is_self,
            previous: None,
            current: status,
            timestamp: strand_common::now_millis(),
        }
    }

    pub fn member_leave(node_id: NodeId, status: NodeStatus) -> Self {
        Self {
            change_type: StatusChangeType::MemberLeave,
            node_id,
            is_self: false,
            previous: Some(status),
            current: NodeStatus::Offline,
            timestamp: strand_common::now_millis(),
        }
    }

    pub fn status_change(
        node_id: NodeId,
        is_self: bool,
        previous: NodeStatus,
        current: NodeStatus,
    ) -> Self {
        Self {
            change_type: StatusChangeType::StatusChange,
            node_id,
            is_self,
            previous: Some(previous),
            current,
            timestamp: strand_common::now_millis(),
        }
    }
}

/// Trait for handling status change events
#[async_trait::async_trait]
pub trait StatusChangeListener: Send + Sync {
    async fn on_status_change(&self, event: &StatusChangeEvent);
}

/// Status change event publisher
/// Broadcasts events to subscribers and notifies registered listeners
pub struct StatusChangeEventPublisher {
    broadcast_tx: broadcast::Sender<StatusChangeEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn StatusChangeListener>>>>,
}

impl StatusChangeEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size);

        Self {
            broadcast_tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn register_listener(&self, listener: Arc<dyn StatusChangeListener>) {
        let mut listeners = self.listeners.write().await;
        listeners.push(listener);
        debug!(
            "Registered status change listener, total: {}",
            listeners.len()
        );
    }

    /// Publish a status change event
    pub async fn publish(&self, event: StatusChangeEvent) {
        // No receivers is fine, quorum requests subscribe only while in flight
        let _ = self.broadcast_tx.send(event.clone());

        let listeners = self.listeners.read().await.clone();
        for listener in listeners.iter() {
            listener.on_status_change(&event).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChangeEvent> {
        self.broadcast_tx.subscribe()
    }
}

/// Logs every status change
pub struct LoggingStatusChangeListener;

#[async_trait::async_trait]
impl StatusChangeListener for LoggingStatusChangeListener {
    async fn on_status_change(&self, event: &StatusChangeEvent) {
        match event.change_type {
            StatusChangeType::MemberJoin => {
                info!(
                    node_id = event.node_id,
                    "[StatusEvent] Member joined (status: {})", event.current
                );
            }
            StatusChangeType::MemberLeave => {
                info!(node_id = event.node_id, "[StatusEvent] Member left");
            }
            StatusChangeType::StatusChange => {
                if let Some(previous) = event.previous {
                    info!(
                        node_id = event.node_id,
                        is_self = event.is_self,
                        "[StatusEvent] Status changed ({} -> {})",
                        previous,
                        event.current
                    );
                }
            }
        }
    }
}
