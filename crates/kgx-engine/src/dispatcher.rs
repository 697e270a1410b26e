//! Event dispatcher
//!
//! Typed fan-out of state-change events to registered subscribers.
//! Subscribers of an event type are invoked in registration order; a
//! failure in one subscriber never prevents delivery to the rest.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{error, trace};

use kgx_core::{EventState, EventType, Result};

/// A subscriber callback for one or more event types
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handle one published event
    async fn handle_event(&self, state: &EventState) -> Result<()>;

    /// Subscriber name for logging
    fn name(&self) -> &str {
        "subscriber"
    }
}

/// Fan-out registry from event type to subscriber list
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: RwLock<HashMap<EventType, Vec<Arc<dyn Subscriber>>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for an event type.
    ///
    /// Registration order is delivery order. Subscribers may be added
    /// while the engine is running.
    pub async fn subscribe(&self, event_type: EventType, subscriber: Arc<dyn Subscriber>) {
        self.subscribers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(subscriber);
    }

    /// Number of subscribers for an event type
    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .read()
            .await
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliver a state to every subscriber of its exact event type.
    ///
    /// Each subscriber failure is logged and isolated.
    pub async fn dispatch(&self, state: &EventState) {
        let subscribers = {
            let guard = self.subscribers.read().await;
            guard.get(&state.event_type).cloned().unwrap_or_default()
        };

        trace!(
            event_type = %state.event_type,
            subscribers = subscribers.len(),
            source = %state.source,
            "dispatching event"
        );

        for subscriber in subscribers {
            if let Err(e) = subscriber.handle_event(state).await {
                error!(
                    subscriber = subscriber.name(),
                    event_type = %state.event_type,
                    error = %e,
                    "subscriber failed, continuing with remaining subscribers"
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
