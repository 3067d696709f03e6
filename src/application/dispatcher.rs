use crate::application::backorder::BackorderCounter;
use crate::application::error::SyncError;
use crate::application::handlers::{
    FulfillmentHandler, InventoryLevelHandler, OrderHandler, ProductHandler, TopicHandler,
    UninstallHandler,
};
use crate::domain::events::{Event, Topic};
use crate::infrastructure::audit::{AuditRecord, AuditSink};
use crate::infrastructure::retry::RetryPolicy;
use crate::infrastructure::store::DownstreamStore;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Handled,
    /// No handler is registered for the topic.
    Unhandled,
}

/// Acknowledgment returned to the upstream for every delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Received,
}

/// Routes events to topic handlers and reports their errors as-is.
#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: HashMap<Topic, Arc<dyn TopicHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, topic: Topic, handler: Arc<dyn TopicHandler>) -> Self {
        self.handlers.insert(topic, handler);
        self
    }

    pub fn with_default_handlers(
        store: Arc<dyn DownstreamStore>,
        retry: RetryPolicy,
        backorders: BackorderCounter,
    ) -> Self {
        let orders: Arc<dyn TopicHandler> =
            Arc::new(OrderHandler::new(store.clone(), retry.clone(), backorders));
        let fulfillments: Arc<dyn TopicHandler> =
            Arc::new(FulfillmentHandler::new(store.clone(), retry.clone()));

        Self::new()
            .register(Topic::OrdersCreate, orders.clone())
            .register(Topic::OrdersUpdated, orders.clone())
            .register(Topic::OrdersPaid, orders)
            .register(
                Topic::InventoryLevelsUpdate,
                Arc::new(InventoryLevelHandler::new(store.clone(), retry.clone())),
            )
            .register(Topic::FulfillmentsCreate, fulfillments.clone())
            .register(Topic::FulfillmentsUpdate, fulfillments)
            .register(
                Topic::ProductsUpdate,
                Arc::new(ProductHandler::new(store.clone(), retry.clone())),
            )
            .register(
                Topic::AppUninstalled,
                Arc::new(UninstallHandler::new(store, retry)),
            )
    }

    pub fn handles(&self, topic: &Topic) -> bool {
        self.handlers.contains_key(topic)
    }

    pub async fn route(&self, event: &Event) -> Result<RouteOutcome, SyncError> {
        match self.handlers.get(&event.topic) {
            Some(handler) => {
                handler.handle(event).await?;
                Ok(RouteOutcome::Handled)
            }
            None => Ok(RouteOutcome::Unhandled),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Wraps a `Dispatcher` so that every event is audited and acknowledged no
/// matter how routing ends. Failures only surface in the audit log.
#[derive(Clone)]
pub struct AlwaysAck {
    dispatcher: Dispatcher,
    audit: Arc<dyn AuditSink>,
}

impl AlwaysAck {
    pub fn new(dispatcher: Dispatcher, audit: Arc<dyn AuditSink>) -> Self {
        Self { dispatcher, audit }
    }

    pub async fn dispatch(&self, event: Event) -> Ack {
        self.append_audit(&event).await;

        let routed = AssertUnwindSafe(self.dispatcher.route(&event))
            .catch_unwind()
            .await;

        let (processed, failure) = match routed {
            Ok(Ok(RouteOutcome::Handled)) => (true, None),
            Ok(Ok(RouteOutcome::Unhandled)) => {
                let reason = match &event.topic {
                    Topic::Unknown(raw) => format!("unknown topic: {}", raw),
                    known => format!("no handler registered for topic: {}", known),
                };
                info!(event_id = %event.id, tenant_id = %event.tenant_id, "{}, acknowledging", reason);
                (false, Some(reason))
            }
            Ok(Err(e)) => {
                error!(
                    event_id = %event.id,
                    tenant_id = %event.tenant_id,
                    topic = %event.topic,
                    "Handler failed: {}",
                    e
                );
                (false, Some(e.to_string()))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    event_id = %event.id,
                    tenant_id = %event.tenant_id,
                    topic = %event.topic,
                    "Handler panicked: {}",
                    message
                );
                (false, Some(format!("handler panicked: {}", message)))
            }
        };

        self.record_outcome(&event, processed, failure).await;
        Ack::Received
    }

    /// Audits `event` as not processed with `reason` and acknowledges it
    /// without routing.
    pub async fn acknowledge_unrouted(&self, event: Event, reason: String) -> Ack {
        warn!(
            event_id = %event.id,
            topic = %event.topic,
            "{}, acknowledging without processing",
            reason
        );
        self.append_audit(&event).await;
        self.record_outcome(&event, false, Some(reason)).await;
        Ack::Received
    }

    async fn append_audit(&self, event: &Event) {
        if let Err(e) = self.audit.append(AuditRecord::received(event)).await {
            warn!(event_id = %event.id, topic = %event.topic, "Failed to write audit record: {}", e);
        }
    }

    async fn record_outcome(&self, event: &Event, processed: bool, failure: Option<String>) {
        if let Err(e) = self
            .audit
            .record_outcome(event.id, processed, failure)
            .await
        {
            warn!(event_id = %event.id, "Failed to record audit outcome: {}", e);
        }
    }
}
