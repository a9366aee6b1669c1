//! Typed deploy lifecycle events and their dispatcher.
//!
//! Handlers are registered per event type and invoked synchronously, in
//! registration order, on the emitter's task. The first handler error stops
//! dispatch for that event and is returned to the emitter. Only
//! `deploy.start` treats a handler error as fatal to the pipeline; the other
//! stages log it to the progress sink and carry on.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use bytes::Bytes;

use crate::config::Environment;
use crate::engine::deployer::DeploymentInfo;
use crate::engine::sink::ProgressSink;

/// Payload for the deploy lifecycle events.
#[derive(Clone)]
pub struct DeployEventData {
    pub sink: ProgressSink,
    pub info: Arc<DeploymentInfo>,
    /// The original request body, for handlers that inspect raw input.
    pub request_body: Bytes,
}

/// Payload for foundation reachability failures.
#[derive(Clone)]
pub struct PrecheckerEventData {
    pub environment: Environment,
    pub description: String,
}

/// The closed set of events the pipeline can emit.
#[derive(Clone)]
pub enum Event {
    DeployStart(DeployEventData),
    DeploySuccess(DeployEventData),
    DeployFailure(DeployEventData),
    DeployError(DeployEventData),
    DeployFinish(DeployEventData),
    FoundationsUnavailable(PrecheckerEventData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    DeployStart,
    DeploySuccess,
    DeployFailure,
    DeployError,
    DeployFinish,
    FoundationsUnavailable,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::DeployStart(_) => EventType::DeployStart,
            Event::DeploySuccess(_) => EventType::DeploySuccess,
            Event::DeployFailure(_) => EventType::DeployFailure,
            Event::DeployError(_) => EventType::DeployError,
            Event::DeployFinish(_) => EventType::DeployFinish,
            Event::FoundationsUnavailable(_) => EventType::FoundationsUnavailable,
        }
    }
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DeployStart => "deploy.start",
            EventType::DeploySuccess => "deploy.success",
            EventType::DeployFailure => "deploy.failure",
            EventType::DeployError => "deploy.error",
            EventType::DeployFinish => "deploy.finish",
            EventType::FoundationsUnavailable => "validate.foundationsUnavailable",
        }
    }
}

/// A registered consumer of events.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &Event) -> Result<()>;
}

/// Dispatches events to handlers registered for their type.
#[derive(Default)]
pub struct EventManager {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the ordered list for `event_type`.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>, event_type: EventType) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.entry(event_type).or_default().push(handler);
    }

    /// Deliver `event` to its handlers in registration order.
    ///
    /// Stops at the first handler that returns an error and returns it.
    pub fn emit(&self, event: &Event) -> Result<()> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(list) = handlers.get(&event.event_type()) {
            for handler in list {
                handler.on_event(event)?;
            }
        }
        Ok(())
    }
}
