//! Event-bus interface and an in-memory implementation.
//!
//! The bus is an external collaborator: the engine subscribes one handler per
//! projection and event type, and the transport decides delivery order and
//! redelivery policy. The in-memory bus here delivers synchronously and is
//! the default transport for tests and embedded use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use common::AggregateId;
use event_store::Event;

use crate::error::BusError;

/// A subscriber that consumes events from the bus.
#[async_trait]
pub trait EventHandler<ID: AggregateId>: Send + Sync {
    /// Name used for diagnostic routing and unsubscription.
    fn handler_name(&self) -> String;

    /// The event types this handler consumes.
    fn event_types(&self) -> Vec<String>;

    /// Handles one delivered event.
    async fn handle_event(&self, event: &Event<ID>) -> Result<(), BusError>;
}

/// Publish/subscribe fan-out for events.
#[async_trait]
pub trait EventBus<ID: AggregateId>: Send + Sync {
    /// Subscribes a handler to an event type.
    async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler<ID>>,
    ) -> Result<(), BusError>;

    /// Removes a handler's subscription to an event type.
    async fn unsubscribe(&self, event_type: &str, handler_name: &str) -> Result<(), BusError>;

    /// Delivers an event to every handler subscribed to its type.
    async fn publish(&self, event: &Event<ID>) -> Result<(), BusError>;
}

/// In-memory synchronous event bus.
///
/// Handlers run outside the subscriber lock; the first handler error is
/// surfaced after every handler has seen the event.
pub struct InMemoryEventBus<ID: AggregateId> {
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler<ID>>>>>,
}

impl<ID: AggregateId> InMemoryEventBus<ID> {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Number of handlers subscribed to an event type.
    pub async fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl<ID: AggregateId> Default for InMemoryEventBus<ID> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<ID: AggregateId> EventBus<ID> for InMemoryEventBus<ID> {
    async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler<ID>>,
    ) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.write().await;
        let handlers = subscribers.entry(event_type.to_string()).or_default();

        if handlers
            .iter()
            .any(|h| h.handler_name() == handler.handler_name())
        {
            return Err(BusError::Subscribe {
                event_type: event_type.to_string(),
                reason: format!("handler '{}' is already subscribed", handler.handler_name()),
            });
        }

        handlers.push(handler);
        Ok(())
    }

    async fn unsubscribe(&self, event_type: &str, handler_name: &str) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.write().await;
        let handlers = subscribers
            .get_mut(event_type)
            .ok_or_else(|| BusError::NotSubscribed {
                event_type: event_type.to_string(),
                handler_name: handler_name.to_string(),
            })?;

        let before = handlers.len();
        handlers.retain(|h| h.handler_name() != handler_name);
        if handlers.len() == before {
            return Err(BusError::NotSubscribed {
                event_type: event_type.to_string(),
                handler_name: handler_name.to_string(),
            });
        }
        if handlers.is_empty() {
            subscribers.remove(event_type);
        }
        Ok(())
    }

    async fn publish(&self, event: &Event<ID>) -> Result<(), BusError> {
        // Snapshot the handler list so user code runs outside the lock.
        let handlers: Vec<Arc<dyn EventHandler<ID>>> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .get(&event.event_type)
                .cloned()
                .unwrap_or_default()
        };

        let mut first_error = None;
        for handler in handlers {
            if let Err(e) = handler.handle_event(event).await
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
