//! Domain events raised by registry mutations.
//!
//! Dispatch is synchronous from the mutation call site to a small fixed set
//! of in-process subscribers, so ordering and failure attribution stay local.
//! Delivery beyond the process boundary (telegram, webhooks) consumes the
//! notification channel and is out of scope here.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    NodeCreated { node_id: i32, name: String },
    NodeConnectionRestored { node_id: i32, name: String },
    NodeConnectionLost { node_id: i32, name: String, reason: String },
    NodeDeleted { node_id: i32, name: String },
    UserCreated { user_id: Uuid, username: String },
    UserDeleted { user_id: Uuid, username: String },
    UserEnabled { user_id: Uuid, username: String },
    UserDisabled { user_id: Uuid, username: String },
    UserLimited { user_id: Uuid, username: String },
    UserExpired { user_id: Uuid, username: String },
    UserThresholdReached { user_id: Uuid, username: String, percent: u8 },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::NodeCreated { .. } => "node_created",
            DomainEvent::NodeConnectionRestored { .. } => "node_connection_restored",
            DomainEvent::NodeConnectionLost { .. } => "node_connection_lost",
            DomainEvent::NodeDeleted { .. } => "node_deleted",
            DomainEvent::UserCreated { .. } => "user_created",
            DomainEvent::UserDeleted { .. } => "user_deleted",
            DomainEvent::UserEnabled { .. } => "user_enabled",
            DomainEvent::UserDisabled { .. } => "user_disabled",
            DomainEvent::UserLimited { .. } => "user_limited",
            DomainEvent::UserExpired { .. } => "user_expired",
            DomainEvent::UserThresholdReached { .. } => "user_threshold_reached",
        }
    }
}

/// A subscriber must swallow its own failures; `handle` has no error channel
/// back to the mutation call site by design.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, event: &DomainEvent);
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus { subscribers: Vec::new() }
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Dispatches to every subscriber in registration order.
    pub async fn emit(&self, event: DomainEvent) {
        debug!(event = event.kind(), "emitting domain event");
        for subscriber in &self.subscribers {
            subscriber.handle(&event).await;
        }
    }
}

/// Fire-and-forget bridge to the out-of-process notification delivery layer.
pub struct NotificationEmitter {
    tx: UnboundedSender<DomainEvent>,
}

impl NotificationEmitter {
    pub fn channel() -> (Arc<NotificationEmitter>, UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(NotificationEmitter { tx }), rx)
    }
}

#[async_trait]
impl EventSubscriber for NotificationEmitter {
    fn name(&self) -> &'static str {
        "notification-emitter"
    }

    async fn handle(&self, event: &DomainEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(event = event.kind(), "no notification consumer attached, dropping event");
        }
    }
}
